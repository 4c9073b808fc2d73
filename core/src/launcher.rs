//! Launchers: how a process record turns a task invocation into a running child
//!
//! [`ProcessLauncher`] is the seam between the record state machine and the
//! OS. [`WorkerLauncher`] re-executes a worker binary; [`MockLauncher`] plays
//! back scripted children so the state machine can be tested without spawning
//! anything.

use crate::channel::OutputChannel;
use crate::shim;
use crate::tasks::TaskTable;
use crate::{CoreError, Result};
use schema::{ProcessId, TaskInvocation};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Starts children for process records
pub trait ProcessLauncher: Send + Sync {
    /// Start `invocation` as process `id`, with its output going to `channel`
    fn launch(
        &self,
        id: ProcessId,
        channel: &OutputChannel,
        invocation: &TaskInvocation,
    ) -> Result<Box<dyn ManagedChild>>;

    /// Whether the launcher can run a task called `name`.
    ///
    /// `None` means the launcher cannot tell, and the name is only checked by
    /// the child.
    fn knows_task(&self, _name: &str) -> Option<bool> {
        None
    }
}

/// A started child as seen by its process record
pub trait ManagedChild: Send + Sync + Debug {
    /// OS process id
    fn pid(&self) -> u32;

    /// Non-blocking liveness check. Reaps the child once it has exited.
    fn is_alive(&mut self) -> Result<bool>;

    /// Stop the child immediately, without any grace period
    fn kill(&mut self) -> Result<()>;

    /// Resident memory in bytes, if the OS still knows the process
    fn resident_memory(&self) -> Option<u64> {
        resident_memory_of(self.pid())
    }
}

/// Resident set size of `pid` as reported by the OS
pub fn resident_memory_of(pid: u32) -> Option<u64> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let sysinfo_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );
    system.process(sysinfo_pid).map(|p| p.memory())
}

/// Launches children by re-executing a worker binary in worker mode
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    executable: PathBuf,
    tasks: Option<TaskTable>,
}

impl WorkerLauncher {
    /// Launcher for the given worker binary
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            tasks: None,
        }
    }

    /// Launcher that re-executes the running binary
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            CoreError::InitializationError(format!("Cannot locate the current executable: {}", e))
        })?;
        Ok(Self::new(exe))
    }

    /// Declare which tasks the worker binary hosts, so unknown names are
    /// rejected before anything is spawned
    pub fn with_tasks(mut self, tasks: TaskTable) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Worker binary path
    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl ProcessLauncher for WorkerLauncher {
    fn launch(
        &self,
        id: ProcessId,
        channel: &OutputChannel,
        invocation: &TaskInvocation,
    ) -> Result<Box<dyn ManagedChild>> {
        use crate::process::unix;

        let stdout = OutputChannel::open_append(channel.stdout_path())?;
        let stderr = OutputChannel::open_append(channel.stderr_path())?;
        let args = shim::child_args(id, channel.dir(), invocation);

        debug!(
            "Launching process {} ({}) via {}",
            id,
            invocation,
            self.executable.display()
        );
        let child = unix::spawn_in_group(&self.executable, &args, stdout, stderr)?;
        Ok(Box::new(WorkerChild { child }))
    }

    fn knows_task(&self, name: &str) -> Option<bool> {
        self.tasks.as_ref().map(|t| t.contains(name))
    }
}

#[derive(Debug)]
struct WorkerChild {
    child: crate::process::unix::ChildProcess,
}

impl ManagedChild for WorkerChild {
    fn pid(&self) -> u32 {
        self.child.pid()
    }

    fn is_alive(&mut self) -> Result<bool> {
        match self.child.try_wait()? {
            None => Ok(true),
            Some(status) => {
                debug!("Process {} exited with {}", self.child.pid(), status);
                Ok(false)
            }
        }
    }

    fn kill(&mut self) -> Result<()> {
        crate::process::unix::kill_group(&self.child)
    }
}

/// Script for one mock child
#[derive(Debug, Clone)]
pub struct MockInstruction {
    /// How long the child "runs" before exiting on its own
    pub exit_delay: Duration,
    /// Written to the stdout log when the child exits on its own
    pub stdout: Option<String>,
    /// Written to the stderr log when the child exits on its own
    pub stderr: Option<String>,
    /// Whether the child exits once the control file appears
    pub honours_stop_request: bool,
    /// Reported resident memory
    pub memory_bytes: Option<u64>,
}

impl Default for MockInstruction {
    fn default() -> Self {
        Self {
            exit_delay: Duration::from_millis(100),
            stdout: None,
            stderr: None,
            honours_stop_request: true,
            memory_bytes: Some(12 * 1024 * 1024),
        }
    }
}

impl MockInstruction {
    /// A child that runs until it is stopped
    pub fn forever() -> Self {
        Self {
            exit_delay: Duration::MAX,
            ..Self::default()
        }
    }

    /// A child that exits after `delay` writing `stderr`
    pub fn failing_after(delay: Duration, stderr: impl Into<String>) -> Self {
        Self {
            exit_delay: delay,
            stderr: Some(stderr.into()),
            ..Self::default()
        }
    }
}

/// Launcher that plays back [`MockInstruction`]s, one per launch
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    instructions: Arc<Mutex<VecDeque<MockInstruction>>>,
    fallback: MockInstruction,
    launches: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
    next_pid: Arc<AtomicU32>,
}

impl MockLauncher {
    /// Mock whose children all follow [`MockInstruction::default`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock whose children follow `fallback` unless an instruction is queued
    pub fn with_fallback(fallback: MockInstruction) -> Self {
        Self {
            fallback,
            ..Self::default()
        }
    }

    /// Queue an instruction for the next launch
    pub fn push(&self, instruction: MockInstruction) {
        if let Ok(mut queue) = self.instructions.lock() {
            queue.push_back(instruction);
        }
    }

    /// How many children were launched
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// How many times a child was force-killed
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for MockLauncher {
    fn launch(
        &self,
        id: ProcessId,
        channel: &OutputChannel,
        invocation: &TaskInvocation,
    ) -> Result<Box<dyn ManagedChild>> {
        let instruction = self
            .instructions
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pid = 40_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        debug!("Launching mock process {} ({}) as pid {}", id, invocation, pid);

        Ok(Box::new(MockChild {
            pid,
            instruction,
            channel: channel.clone(),
            started_at: Instant::now(),
            exited: false,
            kills: Arc::clone(&self.kills),
        }))
    }
}

#[derive(Debug)]
struct MockChild {
    pid: u32,
    instruction: MockInstruction,
    channel: OutputChannel,
    started_at: Instant,
    exited: bool,
    kills: Arc<AtomicUsize>,
}

impl MockChild {
    fn exit_normally(&mut self) -> Result<()> {
        self.exited = true;
        if let Some(text) = &self.instruction.stdout {
            append(self.channel.stdout_path(), text)?;
        }
        if let Some(text) = &self.instruction.stderr {
            append(self.channel.stderr_path(), text)?;
        }
        Ok(())
    }
}

impl ManagedChild for MockChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> Result<bool> {
        if self.exited {
            return Ok(false);
        }
        if self.instruction.honours_stop_request && self.channel.stop_requested() {
            self.exited = true;
            return Ok(false);
        }
        if self.started_at.elapsed() >= self.instruction.exit_delay {
            self.exit_normally()?;
            return Ok(false);
        }
        Ok(true)
    }

    fn kill(&mut self) -> Result<()> {
        if !self.exited {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.exited = true;
        }
        Ok(())
    }

    fn resident_memory(&self) -> Option<u64> {
        if self.exited {
            None
        } else {
            self.instruction.memory_bytes
        }
    }
}

fn append(path: &Path, text: &str) -> Result<()> {
    use std::io::Write;
    let mut file = OutputChannel::open_append(path)?;
    file.write_all(text.as_bytes())
        .map_err(|e| CoreError::io_at(path, "append to", e))?;
    Ok(())
}
