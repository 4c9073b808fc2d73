//! Configuration loading and validation for the process supervisor
//!
//! This module parses an optional TOML file into a [`ManagerConfig`], applies
//! defaults through serde, lets the environment override the output root, and
//! performs validation with field-path error messages.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the directory created under the output root
pub const OUTPUT_DIR_NAME: &str = "processes_output";

/// Environment variable overriding [`ManagerConfig::output_root`]
pub const OUTPUT_ROOT_ENV: &str = "JPM_OUTPUT_ROOT";

/// Settings for a [`crate::ProcessesManager`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Directory under which `processes_output/` is created
    pub output_root: PathBuf,
    /// Delete `stdout_*`/`stderr_*` files left by a previous session
    pub purge_previous_outputs: bool,
    /// Liveness polls made after a termination request before killing
    pub terminate_attempts: u32,
    /// Delay between two liveness polls of the termination protocol
    pub terminate_poll_millis: u64,
    /// Maximum number of process rows in a status table
    pub max_rows: usize,
    /// Executable re-launched in child mode; defaults to the current executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_executable: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            purge_previous_outputs: true,
            terminate_attempts: 50,
            terminate_poll_millis: 100,
            max_rows: 20,
            worker_executable: None,
        }
    }
}

impl ManagerConfig {
    /// Config rooted at `root` with every other field defaulted
    pub fn with_output_root(root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: root.into(),
            ..Self::default()
        }
    }

    /// Shared directory holding every log and control file
    pub fn output_dir(&self) -> PathBuf {
        self.output_root.join(OUTPUT_DIR_NAME)
    }

    /// Interval between liveness polls while terminating
    pub fn terminate_poll(&self) -> Duration {
        Duration::from_millis(self.terminate_poll_millis)
    }

    /// Total cooperative window granted to a child before it is killed
    pub fn cooperative_window(&self) -> Duration {
        self.terminate_poll().saturating_mul(self.terminate_attempts)
    }

    /// Apply `JPM_OUTPUT_ROOT` if it is set and non-empty
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var(OUTPUT_ROOT_ENV) {
            if !root.trim().is_empty() {
                self.output_root = PathBuf::from(root);
            }
        }
        self
    }

    /// Validate the configuration and return field-path errors
    pub fn validate(&self) -> Result<()> {
        if self.output_root.as_os_str().is_empty() {
            return Err(CoreError::ValidationError(
                "outputRoot: cannot be empty".to_string(),
            ));
        }
        if self.terminate_attempts == 0 {
            return Err(CoreError::ValidationError(
                "terminateAttempts: must be > 0".to_string(),
            ));
        }
        if self.terminate_poll_millis == 0 {
            return Err(CoreError::ValidationError(
                "terminatePollMillis: must be > 0".to_string(),
            ));
        }
        if self.max_rows < 2 {
            return Err(CoreError::ValidationError(
                "maxRows: must be >= 2".to_string(),
            ));
        }
        if let Some(exe) = &self.worker_executable {
            if exe.as_os_str().is_empty() {
                return Err(CoreError::ValidationError(
                    "workerExecutable: cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load a manager config from a TOML file path
pub fn load_config_from_toml_path(path: impl AsRef<Path>) -> Result<ManagerConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_config_from_toml_str(&data)
}

/// Load a manager config from a TOML string
pub fn load_config_from_toml_str(input: &str) -> Result<ManagerConfig> {
    let cfg: ManagerConfig = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
