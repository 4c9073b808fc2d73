//! Core of the jpm process supervisor
//!
//! Launches named tasks as child processes, captures their output in
//! per-process log files, tracks their status, and stops them with a
//! cooperative-then-forced protocol.
//!
//! ```rust,no_run
//! use jpm_core::{tasks, ManagerConfig, ProcessesManager, TaskInvocation};
//! use std::time::Duration;
//!
//! # async fn demo() -> jpm_core::Result<()> {
//! // Worker side: a no-op unless this process was started as a worker
//! jpm_core::shim::run_if_child(&tasks::builtin_tasks());
//!
//! let mut manager = ProcessesManager::with_worker(ManagerConfig::default())?;
//! for secs in ["1", "2"] {
//!     manager.submit(TaskInvocation::new("sleep", [secs]))?;
//! }
//! manager.wait_until_all_done(Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("jpm_core only supports Unix targets: workers rely on process groups and dup2");

pub mod allocator;
pub mod channel;
pub mod config;
pub mod error;
pub mod format;
pub mod launcher;
pub mod manager;
pub mod process;
pub mod record;
pub mod shim;
pub mod tasks;

#[cfg(test)]
mod error_tests;

// Re-export schema types for convenience
pub use schema::*;

pub use allocator::IdAllocator;
pub use channel::{OutputChannel, ERROR_MARKER};
pub use config::{load_config_from_toml_path, load_config_from_toml_str, ManagerConfig};
pub use error::{CoreError, Result};
pub use launcher::{ManagedChild, MockInstruction, MockLauncher, ProcessLauncher, WorkerLauncher};
pub use manager::{ProcessesManager, WaitOutcome};
pub use record::ProcessRecord;
pub use tasks::{TaskContext, TaskFn, TaskTable};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Install a fmt subscriber filtered at `level` (`RUST_LOG` wins when set)
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
