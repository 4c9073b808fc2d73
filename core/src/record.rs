//! One supervised process: its state machine, output channel and child handle
//!
//! ```text
//! NotStarted --start--> Running --refresh, exited--> Finished | Error
//!                          |
//!                          +--terminate--> TerminatedByUser
//! ```
//!
//! Transitions only happen when someone asks: [`ProcessRecord::refresh_status`]
//! polls the child, [`ProcessRecord::terminate`] runs the two-phase stop.
//! Terminal states never change again.

use crate::channel::OutputChannel;
use crate::format::{format_duration, format_memory};
use crate::launcher::{ManagedChild, ProcessLauncher};
use crate::shim::{self, RedirectGuard};
use crate::tasks::{TaskContext, TaskTable};
use crate::{CoreError, Result};
use schema::{ProcessId, ProcessRow, ProcessStatus, TaskInvocation};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shown for values that do not apply in the current state
pub const NOT_AVAILABLE: &str = "None";

/// Default number of lines returned by [`ProcessRecord::last_stdout_lines`]
pub const DEFAULT_TAIL_LINES: usize = 100;

/// How long to wait for a force-killed child to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bookkeeping for one process id
#[derive(Debug)]
pub struct ProcessRecord {
    id: ProcessId,
    channel: OutputChannel,
    invocation: Option<TaskInvocation>,
    child: Option<Box<dyn ManagedChild>>,
    status: ProcessStatus,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl ProcessRecord {
    /// Record for `id` whose logs live in `output_dir`. Both logs are created
    /// empty and any old control file is removed.
    pub fn create(id: ProcessId, output_dir: impl AsRef<Path>) -> Result<Self> {
        let channel = OutputChannel::new(output_dir, id);
        channel.create()?;
        Ok(Self {
            id,
            channel,
            invocation: None,
            child: None,
            status: ProcessStatus::NotStarted,
            started_at: None,
            finished_at: None,
        })
    }

    /// Start `invocation` through `launcher`. Returns as soon as the child exists.
    pub fn start(&mut self, launcher: &dyn ProcessLauncher, invocation: TaskInvocation) -> Result<()> {
        if self.child.is_some() || self.status != ProcessStatus::NotStarted {
            return Err(CoreError::AlreadyStarted(self.id));
        }

        let child = launcher.launch(self.id, &self.channel, &invocation)?;
        info!("Started process {} (pid {}): {}", self.id, child.pid(), invocation);
        self.child = Some(child);
        self.invocation = Some(invocation);
        self.started_at = Some(Instant::now());
        self.status = ProcessStatus::Running;
        Ok(())
    }

    /// Run `invocation` in the calling process with stdout and stderr
    /// redirected to this record's logs. The record itself stays
    /// `NotStarted`. A failing or panicking task is returned as
    /// [`CoreError::TaskFailed`] and leaves an error record in stderr.
    pub fn debug_run(&mut self, table: &TaskTable, invocation: TaskInvocation) -> Result<()> {
        if self.child.is_some() {
            return Err(CoreError::AlreadyStarted(self.id));
        }
        debug!("Debug-running process {}: {}", self.id, invocation);

        let ctx = TaskContext::detached(self.id);
        let outcome = {
            let _guard = RedirectGuard::install(&self.channel)?;
            shim::run_task_catching_panics(table, &invocation, &ctx)
        };
        self.invocation = Some(invocation);
        outcome
    }

    /// Poll the child and update the status. Returns whether it is still alive.
    ///
    /// Cheap and idempotent once the record is terminal.
    pub fn refresh_status(&mut self) -> Result<bool> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };

        if child.is_alive()? {
            self.status = ProcessStatus::Running;
            return Ok(true);
        }

        self.finished_at = Some(Instant::now());
        self.status = match self.channel.error_records() {
            Ok(records) if !records.is_empty() => ProcessStatus::Error,
            Ok(_) => ProcessStatus::Finished,
            Err(e) => {
                warn!("Could not read stderr of process {}: {}", self.id, e);
                ProcessStatus::Finished
            }
        };
        info!("Process {} is {}", self.id, self.status);
        Ok(false)
    }

    /// Stop the child: request a cooperative stop through the control file,
    /// poll `attempts` times every `poll`, then kill it if it is still there.
    ///
    /// A child that already exited keeps its natural status. Otherwise the
    /// record ends up `TerminatedByUser` however the child went away.
    ///
    /// Blocks the calling thread; async callers use
    /// [`terminate_async`](Self::terminate_async).
    pub fn terminate(&mut self, attempts: u32, poll: Duration) -> Result<()> {
        let Some(requested) = self.begin_stop()? else {
            return Ok(());
        };

        let mut exited = false;
        if requested {
            for _ in 0..attempts {
                std::thread::sleep(poll);
                if !self.child_alive()? {
                    exited = true;
                    break;
                }
            }
        }

        if !exited {
            self.force_kill(attempts, poll)?;
            let deadline = Instant::now().checked_add(KILL_REAP_TIMEOUT);
            while self.awaiting_reap(deadline)? {
                std::thread::sleep(reap_poll(poll));
            }
        }
        self.mark_terminated(exited);
        Ok(())
    }

    /// [`terminate`](Self::terminate) that sleeps on the tokio timer instead
    /// of blocking the thread
    pub async fn terminate_async(&mut self, attempts: u32, poll: Duration) -> Result<()> {
        let Some(requested) = self.begin_stop()? else {
            return Ok(());
        };

        let mut exited = false;
        if requested {
            for _ in 0..attempts {
                tokio::time::sleep(poll).await;
                if !self.child_alive()? {
                    exited = true;
                    break;
                }
            }
        }

        if !exited {
            self.force_kill(attempts, poll)?;
            let deadline = Instant::now().checked_add(KILL_REAP_TIMEOUT);
            while self.awaiting_reap(deadline)? {
                tokio::time::sleep(reap_poll(poll)).await;
            }
        }
        self.mark_terminated(exited);
        Ok(())
    }

    /// Refresh, then write the control file for a child that is still
    /// running. `None` when there is nothing left to stop, otherwise whether
    /// the stop request was written.
    fn begin_stop(&mut self) -> Result<Option<bool>> {
        if !self.refresh_status()? || self.child.is_none() {
            return Ok(None);
        }
        match self.channel.request_stop() {
            Ok(()) => {
                debug!("Requested stop of process {}", self.id);
                Ok(Some(true))
            }
            Err(e) => {
                warn!("Could not request stop of process {}: {}", self.id, e);
                Ok(Some(false))
            }
        }
    }

    fn child_alive(&mut self) -> Result<bool> {
        match self.child.as_mut() {
            Some(child) => child.is_alive(),
            None => Ok(false),
        }
    }

    fn force_kill(&mut self, attempts: u32, poll: Duration) -> Result<()> {
        warn!(
            "Process {} did not stop within {:?}, killing it",
            self.id,
            poll.saturating_mul(attempts)
        );
        match self.child.as_mut() {
            Some(child) => child.kill(),
            None => Ok(()),
        }
    }

    /// Whether a killed child is still around and worth waiting for
    fn awaiting_reap(&mut self, deadline: Option<Instant>) -> Result<bool> {
        if !self.child_alive()? {
            return Ok(false);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                "Process {} survived SIGKILL for {:?}",
                self.id, KILL_REAP_TIMEOUT
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn mark_terminated(&mut self, cooperative: bool) {
        if cooperative {
            debug!("Process {} stopped cooperatively", self.id);
        }
        self.status = ProcessStatus::TerminatedByUser;
        self.finished_at = Some(Instant::now());
        info!("Process {} terminated by user", self.id);
    }

    /// Kill a still-running child without the cooperative phase
    pub fn kill_now(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Running {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            if child.is_alive()? {
                child.kill()?;
            }
        }
        self.status = ProcessStatus::TerminatedByUser;
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    /// Process id
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Last observed status
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// What was started or debug-run, if anything
    pub fn invocation(&self) -> Option<&TaskInvocation> {
        self.invocation.as_ref()
    }

    /// The record's log and control files
    pub fn channel(&self) -> &OutputChannel {
        &self.channel
    }

    /// OS pid, only while running
    pub fn pid(&self) -> Option<u32> {
        match (&self.child, self.status) {
            (Some(child), ProcessStatus::Running) => Some(child.pid()),
            _ => None,
        }
    }

    /// Resident memory in bytes, only while running
    pub fn resident_memory(&self) -> Option<u64> {
        match (&self.child, self.status) {
            (Some(child), ProcessStatus::Running) => child.resident_memory(),
            _ => None,
        }
    }

    /// Resident memory as `"12 MB"`/`"1.5 GB"`, or `"None"`
    pub fn memory_usage(&self) -> String {
        self.resident_memory()
            .map(format_memory)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string())
    }

    /// Time since start, frozen at the finish time once terminal
    pub fn running_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(match self.finished_at {
            Some(finished) => finished.saturating_duration_since(started),
            None => started.elapsed(),
        })
    }

    /// [`running_duration`](Self::running_duration) formatted, or `"None"`
    pub fn running_duration_text(&self) -> String {
        self.running_duration()
            .map(format_duration)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string())
    }

    /// Whole stdout log, or [`EMPTY_OUTPUT`](crate::channel::EMPTY_OUTPUT)
    /// when it has no lines yet
    pub fn stdout_text(&self) -> Result<String> {
        self.channel.read_stdout_or_sentinel()
    }

    /// Whole stderr log
    pub fn stderr_text(&self) -> Result<String> {
        self.channel.read_stderr()
    }

    /// At most the last `n` lines of stdout
    pub fn last_stdout_lines(&self, n: usize) -> Result<String> {
        let text = self.channel.read_stdout()?;
        Ok(tail_lines(&text, n))
    }

    /// Most recent error record, if any
    pub fn last_error_message(&self) -> Result<Option<String>> {
        Ok(self.channel.error_records()?.pop())
    }

    /// Every error record, oldest first
    pub fn all_error_messages(&self) -> Result<Vec<String>> {
        self.channel.error_records()
    }

    /// Row for the status table
    pub fn row(&self) -> ProcessRow {
        ProcessRow {
            os_pid: self.pid(),
            process_id: self.id,
            status: self.status,
            running_duration: self.running_duration_text(),
            memory_usage: self.memory_usage(),
        }
    }
}

impl Drop for ProcessRecord {
    fn drop(&mut self) {
        if let Err(e) = self.kill_now() {
            warn!("Failed to kill process {} on drop: {}", self.id, e);
        }
    }
}

fn reap_poll(poll: Duration) -> Duration {
    poll.min(Duration::from_millis(100))
}

/// Last `n` lines of `text`; all of it when it has fewer lines
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= n {
        return text.to_string();
    }
    lines[lines.len() - n..].join("\n")
}
