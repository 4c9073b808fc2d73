//! Identifier allocation: a durable, lock-protected counter per output directory
//!
//! Each new process record reserves the next integer from a versioned JSON
//! state file living next to the logs. Writes are crash-safe via
//! write-to-temp + fsync + rename, and concurrent reservations (from several
//! threads or several supervisors pointed at the same directory) are
//! serialized through an exclusive advisory lock on a sibling lock file.

use crate::{CoreError, Result};
use fs2::FileExt;
use schema::ProcessId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Counter file format version
pub const STATE_VERSION: u32 = 1;

/// File holding the counter inside the output directory
pub const STATE_FILE_NAME: &str = "jpm_state.json";

/// Lock file guarding read-modify-write cycles on the counter
pub const LOCK_FILE_NAME: &str = "jpm_state.lock";

/// On-disk representation of the counter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorState {
    /// Format version
    pub version: u32,
    /// Highest identifier handed out so far (0 when none)
    pub max_used_process_id: ProcessId,
    /// RFC3339 timestamp of the last reservation
    pub timestamp: String,
}

/// Hands out strictly increasing process identifiers that survive restarts
#[derive(Debug, Clone)]
pub struct IdAllocator {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl IdAllocator {
    /// Allocator persisting its counter inside `dir` (which must exist)
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            state_path: dir.join(STATE_FILE_NAME),
            lock_path: dir.join(LOCK_FILE_NAME),
        }
    }

    /// Path of the JSON counter file
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Atomically reserve and return the next identifier.
    ///
    /// The first identifier issued for a fresh directory is 1.
    pub fn reserve_next(&self) -> Result<ProcessId> {
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| CoreError::io_at(&self.lock_path, "open lock", e))?;
        lock.lock_exclusive()
            .map_err(|e| CoreError::io_at(&self.lock_path, "lock", e))?;

        let result = self.bump();

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
        result
    }

    /// Highest identifier reserved so far, 0 when nothing was reserved
    pub fn current(&self) -> Result<ProcessId> {
        Ok(self.load()?.map_or(0, |s| s.max_used_process_id))
    }

    fn bump(&self) -> Result<ProcessId> {
        let previous = self.load()?.map_or(0, |s| s.max_used_process_id);
        let next = previous
            .checked_add(1)
            .ok_or_else(|| CoreError::Allocator("process id counter overflowed".to_string()))?;
        let state = AllocatorState {
            version: STATE_VERSION,
            max_used_process_id: next,
            timestamp: schema::current_timestamp(),
        };
        write_state_atomic(&self.state_path, &state)?;
        tracing::debug!("Reserved process id {}", next);
        Ok(next)
    }

    fn load(&self) -> Result<Option<AllocatorState>> {
        let buf = match fs::read_to_string(&self.state_path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::io_at(&self.state_path, "read", e)),
        };
        let state: AllocatorState = serde_json::from_str(&buf).map_err(|e| {
            CoreError::Allocator(format!(
                "Corrupt counter file {}: {}",
                self.state_path.display(),
                e
            ))
        })?;
        if state.version != STATE_VERSION {
            return Err(CoreError::Allocator(format!(
                "Unsupported counter version {} (expected {})",
                state.version, STATE_VERSION
            )));
        }
        Ok(Some(state))
    }
}

fn write_state_atomic(path: &Path, state: &AllocatorState) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(state)?;

    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| CoreError::io_at(&tmp_path, "open temp counter", e))?;
        f.write_all(&json)
            .map_err(|e| CoreError::io_at(&tmp_path, "write temp counter", e))?;
        f.flush().ok();
        let _ = f.sync_all();
    }

    fs::rename(&tmp_path, path).map_err(|e| CoreError::io_at(path, "replace counter", e))?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
