//! Per-process output channel: stdout log, stderr log and control file
//!
//! The three paths are derived from the process id alone so the parent and
//! the child can agree on them without exchanging anything but the id and the
//! output directory.
//!
//! ## Control file protocol
//!
//! Two states only. Absent means "keep running". Present means "stop
//! requested". The parent creates it, the child's watcher polls for it every
//! [`CONTROL_POLL_INTERVAL`]. Its content is informational.
//!
//! ## Error marker contract
//!
//! The child reports an unhandled failure by writing a record that begins with
//! [`ERROR_MARKER`] to its stderr log. The parent never looks at exit codes to
//! classify a run; it splits stderr on the marker instead (see
//! [`split_error_records`]).

use crate::{CoreError, Result};
use schema::ProcessId;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker that opens every error record in a stderr log
pub const ERROR_MARKER: &str = "Traceback ";

/// How often the child checks for the control file
pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Returned by [`OutputChannel::read_stdout_or_sentinel`] when the log has no lines
pub const EMPTY_OUTPUT: &str = "<empty>";

const STDOUT_PREFIX: &str = "stdout_";
const STDERR_PREFIX: &str = "stderr_";
const CONTROL_PREFIX: &str = "jpm_stderr_";
const LOG_SUFFIX: &str = ".txt";

/// Paths of the files belonging to one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChannel {
    dir: PathBuf,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    control_path: PathBuf,
}

impl OutputChannel {
    /// Channel for `id` inside `output_dir`. Touches nothing on disk.
    pub fn new(output_dir: impl AsRef<Path>, id: ProcessId) -> Self {
        let dir = output_dir.as_ref();
        Self {
            dir: dir.to_path_buf(),
            stdout_path: dir.join(format!("{STDOUT_PREFIX}{id}{LOG_SUFFIX}")),
            stderr_path: dir.join(format!("{STDERR_PREFIX}{id}{LOG_SUFFIX}")),
            control_path: dir.join(format!("{CONTROL_PREFIX}{id}{LOG_SUFFIX}")),
        }
    }

    /// Directory holding the files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the stdout log
    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    /// Path of the stderr log
    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    /// Path of the control file
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Create both logs empty and make sure no control file is lying around
    pub fn create(&self) -> Result<()> {
        for path in [&self.stdout_path, &self.stderr_path] {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|e| CoreError::io_at(path, "create log", e))?;
        }
        self.clear_stop_request()
    }

    /// Open a log for appending, creating it when missing
    pub fn open_append(path: &Path) -> Result<fs::File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CoreError::io_at(path, "open log", e))
    }

    /// Full stdout log content, empty when the file does not exist
    pub fn read_stdout(&self) -> Result<String> {
        read_or_empty(&self.stdout_path)
    }

    /// Like [`read_stdout`](Self::read_stdout) but returns [`EMPTY_OUTPUT`]
    /// when the log holds no lines
    pub fn read_stdout_or_sentinel(&self) -> Result<String> {
        let text = self.read_stdout()?;
        if text.lines().next().is_none() {
            return Ok(EMPTY_OUTPUT.to_string());
        }
        Ok(text)
    }

    /// Full stderr log content, empty when the file does not exist
    pub fn read_stderr(&self) -> Result<String> {
        read_or_empty(&self.stderr_path)
    }

    /// Error records found in the stderr log, oldest first
    pub fn error_records(&self) -> Result<Vec<String>> {
        Ok(split_error_records(&self.read_stderr()?))
    }

    /// Ask the child to stop by creating the control file
    pub fn request_stop(&self) -> Result<()> {
        fs::write(&self.control_path, b"stop requested\n")
            .map_err(|e| CoreError::io_at(&self.control_path, "write control file", e))
    }

    /// Whether a stop has been requested
    pub fn stop_requested(&self) -> bool {
        self.control_path.exists()
    }

    /// Remove the control file. Missing is fine.
    pub fn clear_stop_request(&self) -> Result<()> {
        match fs::remove_file(&self.control_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::io_at(&self.control_path, "remove control file", e)),
        }
    }
}

/// Whether `file_name` is one of the files an [`OutputChannel`] produces
pub fn is_channel_file(file_name: &str) -> bool {
    [STDOUT_PREFIX, STDERR_PREFIX, CONTROL_PREFIX]
        .iter()
        .any(|prefix| {
            file_name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(LOG_SUFFIX))
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
        })
}

/// Split stderr text into error records.
///
/// Each occurrence of [`ERROR_MARKER`] opens a record that runs up to the next
/// occurrence. Text before the first marker is not part of any record. Empty
/// records are dropped.
pub fn split_error_records(stderr: &str) -> Vec<String> {
    let mut parts = stderr.split(ERROR_MARKER);
    // Anything ahead of the first marker is ordinary stderr chatter
    parts.next();
    parts
        .filter(|body| !body.is_empty())
        .map(|body| format!("{ERROR_MARKER}{body}"))
        .collect()
}

fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CoreError::io_at(path, "read log", e)),
    }
}
