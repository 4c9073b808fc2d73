//! Process status and snapshot types for the jpm supervisor
//!
//! ## Process Lifecycle
//!
//! Every supervised process moves through a monotonic state machine:
//!
//! ```text
//! NotStarted → Running → { Finished | Error | TerminatedByUser }
//! ```
//!
//! The three right-hand states are terminal; once entered they are never left.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier handed out to each supervised process.
///
/// Unique and strictly increasing within one output directory.
pub type ProcessId = u64;

/// Current state of a supervised process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    /// The record exists but its OS process was never spawned
    NotStarted,
    /// The OS process is alive
    Running,
    /// The process exited and no error marker was found in its stderr log
    Finished,
    /// The process exited and its stderr log contains at least one error record
    Error,
    /// The process was stopped through the termination protocol
    TerminatedByUser,
}

impl ProcessStatus {
    /// Whether this status can never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Finished | ProcessStatus::Error | ProcessStatus::TerminatedByUser
        )
    }

    /// Human readable label used in status tables
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::NotStarted => "Not Started",
            ProcessStatus::Running => "Running",
            ProcessStatus::Finished => "Finished",
            ProcessStatus::Error => "Error",
            ProcessStatus::TerminatedByUser => "Terminated by user",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named unit of work to execute inside a supervised process
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskInvocation {
    /// Name of the task as registered in the worker's task table
    pub task: String,
    /// Positional arguments passed to the task
    #[serde(default)]
    pub args: Vec<String>,
}

impl TaskInvocation {
    /// Build an invocation from a task name and its arguments
    pub fn new<I, S>(task: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task: task.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Invocation of `task` without arguments
    pub fn named(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
        }
    }
}

impl fmt::Display for TaskInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.task)
        } else {
            write!(f, "{} {}", self.task, self.args.join(" "))
        }
    }
}

/// One process line of a status table
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRow {
    /// OS pid while the process is running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_pid: Option<u32>,
    /// Supervisor-assigned identifier (also names the log files)
    pub process_id: ProcessId,
    /// Current status
    pub status: ProcessStatus,
    /// Formatted running duration, `"None"` if never started
    pub running_duration: String,
    /// Formatted resident memory, `"None"` unless running
    pub memory_usage: String,
}

/// A row of a status table: either a process or a marker for elided rows
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum StatusRow {
    /// A visible process
    Process(ProcessRow),
    /// Placeholder standing in for `count` rows that were not displayed
    Hidden {
        /// Number of processes left out of the table
        count: usize,
    },
}

/// Status of every process known to a registry
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Rows in creation order, possibly with a hidden-rows marker in the middle
    pub rows: Vec<StatusRow>,
    /// Processes still alive after this refresh
    pub alive_count: usize,
    /// Processes ever submitted to the registry
    pub total_count: usize,
    /// How long the current batch has been running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_for: Option<String>,
}

impl StatusSnapshot {
    /// Iterate over the visible process rows, skipping markers
    pub fn processes(&self) -> impl Iterator<Item = &ProcessRow> {
        self.rows.iter().filter_map(|row| match row {
            StatusRow::Process(p) => Some(p),
            StatusRow::Hidden { .. } => None,
        })
    }

    /// Number of rows elided from the table, zero when everything is shown
    pub fn hidden_count(&self) -> usize {
        self.rows
            .iter()
            .map(|row| match row {
                StatusRow::Hidden { count } => *count,
                StatusRow::Process(_) => 0,
            })
            .sum()
    }

    /// Whether every submitted process has stopped
    pub fn all_done(&self) -> bool {
        self.alive_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ProcessStatus::NotStarted.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(ProcessStatus::Finished.is_terminal());
        assert!(ProcessStatus::Error.is_terminal());
        assert!(ProcessStatus::TerminatedByUser.is_terminal());
    }

    #[test]
    fn status_labels() {
        assert_eq!(ProcessStatus::NotStarted.to_string(), "Not Started");
        assert_eq!(ProcessStatus::TerminatedByUser.to_string(), "Terminated by user");
    }

    #[test]
    fn invocation_display() {
        assert_eq!(TaskInvocation::new("sleep", ["3"]).to_string(), "sleep 3");
        assert_eq!(TaskInvocation::new("spin", Vec::<String>::new()).to_string(), "spin");
    }

    #[test]
    fn snapshot_counts_hidden_rows() {
        let row = ProcessRow {
            os_pid: Some(10),
            process_id: 1,
            status: ProcessStatus::Running,
            running_duration: "2 seconds".into(),
            memory_usage: "3.1 MB".into(),
        };
        let snap = StatusSnapshot {
            rows: vec![
                StatusRow::Process(row.clone()),
                StatusRow::Hidden { count: 7 },
                StatusRow::Process(ProcessRow { process_id: 9, ..row }),
            ],
            alive_count: 9,
            total_count: 9,
            working_for: None,
        };
        assert_eq!(snap.hidden_count(), 7);
        assert_eq!(snap.processes().count(), 2);
        assert!(!snap.all_done());
    }
}
