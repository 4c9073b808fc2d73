//! Runtime redirection shim: what a worker child does before and after its task
//!
//! A supervisor starts a worker by re-executing a binary with
//! [`CHILD_FLAG`] as the first argument (see [`child_args`]). That binary calls
//! [`run_if_child`] first thing in `main`, which then:
//!
//! 1. points fd 1 and fd 2 at the channel's log files ([`RedirectGuard`]),
//! 2. installs a `tracing` subscriber on the redirected stderr,
//! 3. installs a panic hook that writes an error record,
//! 4. starts the [`ControlWatcher`],
//! 5. runs the task, and exits with 0 (ok), 1 (task failed) or 2 (bad
//!    invocation).
//!
//! Failures are reported on stderr as records starting with
//! [`ERROR_MARKER`](crate::channel::ERROR_MARKER), which is what the parent
//! classifies on.

// dup2() over the standard descriptors needs unsafe
#![allow(unsafe_code)]

use crate::channel::{OutputChannel, CONTROL_POLL_INTERVAL, ERROR_MARKER};
use crate::tasks::{TaskContext, TaskTable};
use crate::{CoreError, Result};
use schema::{ProcessId, TaskInvocation};
use std::any::Any;
use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// First argument that switches a binary into worker mode
pub const CHILD_FLAG: &str = "__jpm-child";

/// Exit code of a worker whose task succeeded
pub const EXIT_OK: i32 = 0;
/// Exit code of a worker whose task returned an error or panicked
pub const EXIT_TASK_FAILED: i32 = 1;
/// Exit code of a worker started with an unknown task or malformed arguments
pub const EXIT_BAD_INVOCATION: i32 = 2;

/// Command line (after the program name) that starts `invocation` as process `id`
pub fn child_args(id: ProcessId, output_dir: &Path, invocation: &TaskInvocation) -> Vec<OsString> {
    let mut args = vec![
        OsString::from(CHILD_FLAG),
        OsString::from(id.to_string()),
        output_dir.as_os_str().to_owned(),
        OsString::from(&invocation.task),
    ];
    args.extend(invocation.args.iter().map(OsString::from));
    args
}

/// Worker entry point. Returns immediately unless the process was started
/// with [`CHILD_FLAG`], in which case it runs the task and exits.
pub fn run_if_child(table: &TaskTable) {
    let mut args = std::env::args_os().skip(1);
    if args.next().as_deref() != Some(OsStr::new(CHILD_FLAG)) {
        return;
    }
    let code = child_main(table, args.collect());
    std::process::exit(code);
}

struct ChildArgs {
    id: ProcessId,
    output_dir: PathBuf,
    invocation: TaskInvocation,
}

fn parse_child_args(args: Vec<OsString>) -> std::result::Result<ChildArgs, String> {
    let mut args = args.into_iter();
    let id = args
        .next()
        .and_then(|s| s.into_string().ok())
        .ok_or("missing process id")?;
    let id: ProcessId = id.parse().map_err(|_| format!("invalid process id {id:?}"))?;
    let output_dir = PathBuf::from(args.next().ok_or("missing output directory")?);
    let task = args
        .next()
        .ok_or("missing task name")?
        .into_string()
        .map_err(|s| format!("task name is not UTF-8: {s:?}"))?;
    let task_args = args
        .map(|a| a.into_string().map_err(|s| format!("argument is not UTF-8: {s:?}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ChildArgs {
        id,
        output_dir,
        invocation: TaskInvocation::new(task, task_args),
    })
}

fn child_main(table: &TaskTable, raw_args: Vec<OsString>) -> i32 {
    let args = match parse_child_args(raw_args) {
        Ok(args) => args,
        Err(message) => {
            // Still on the descriptors the parent gave us, which are the logs
            eprint!("{}", error_record(&format!("bad worker invocation: {message}")));
            return EXIT_BAD_INVOCATION;
        }
    };

    let channel = OutputChannel::new(&args.output_dir, args.id);
    let guard = match RedirectGuard::install(&channel) {
        Ok(guard) => guard,
        Err(e) => {
            eprint!("{}", error_record(&format!("could not redirect output: {e}")));
            return EXIT_BAD_INVOCATION;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
    install_panic_hook();

    let ctx = TaskContext::new(args.id, Arc::new(AtomicBool::new(false)));
    let watcher = ControlWatcher::spawn(channel.clone(), ctx.clone());

    debug!("Worker {} running {}", args.id, args.invocation);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_task(table, &args.invocation, &ctx)));

    watcher.stop();
    let code = match outcome {
        Ok(Ok(())) => EXIT_OK,
        Ok(Err(CoreError::UnknownTask(_))) => EXIT_BAD_INVOCATION,
        Ok(Err(_)) => EXIT_TASK_FAILED,
        // The panic hook already wrote the record
        Err(_) => EXIT_TASK_FAILED,
    };
    drop(guard);
    code
}

/// Look up and run `invocation`, writing an error record to stderr on failure.
///
/// The caller decides where stderr points; the worker and
/// [`ProcessesManager::debug_run`](crate::ProcessesManager::debug_run) both
/// wrap this in a [`RedirectGuard`].
pub fn run_task(table: &TaskTable, invocation: &TaskInvocation, ctx: &TaskContext) -> Result<()> {
    let Some(task) = table.get(&invocation.task) else {
        write_stderr(&error_record(&format!("unknown task '{}'", invocation.task)));
        return Err(CoreError::UnknownTask(invocation.task.clone()));
    };

    match task(ctx, &invocation.args) {
        Ok(()) => Ok(()),
        Err(e) => {
            let message = format!("{e:#}");
            write_stderr(&error_record(&format!(
                "task '{}' failed: {}",
                invocation.task, message
            )));
            Err(CoreError::TaskFailed {
                task: invocation.task.clone(),
                message,
            })
        }
    }
}

/// [`run_task`] for callers that must survive the task: a panic is reported
/// as an error record on stderr and returned as [`CoreError::TaskFailed`]
/// instead of unwinding further.
pub fn run_task_catching_panics(table: &TaskTable, invocation: &TaskInvocation, ctx: &TaskContext) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| run_task(table, invocation, ctx))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = format!("panicked: {}", panic_message(payload.as_ref()));
            write_stderr(&error_record(&format!("task '{}' {}", invocation.task, message)));
            Err(CoreError::TaskFailed {
                task: invocation.task.clone(),
                message,
            })
        }
    }
}

/// A complete error record for `detail`
pub fn error_record(detail: &str) -> String {
    format!("{ERROR_MARKER}(most recent call last):\n  {detail}\n")
}

fn write_stderr(text: &str) {
    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(text.as_bytes());
    let _ = stderr.flush();
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        write_stderr(&error_record(&format!(
            "task panicked: {message} at {location}"
        )));
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_string())
}

/// Points fd 1 and fd 2 at a channel's logs until dropped.
///
/// Logs are opened in append mode, so anything already written (for example
/// by the parent before the child got here) is kept. Everything that writes to
/// the standard descriptors follows, including `println!`, `eprintln!` and any
/// `tracing` subscriber writing to stdout or stderr.
#[derive(Debug)]
pub struct RedirectGuard {
    saved_stdout: OwnedFd,
    saved_stderr: OwnedFd,
}

impl RedirectGuard {
    /// Redirect the standard streams of the current process
    pub fn install(channel: &OutputChannel) -> Result<Self> {
        let stdout_log = OutputChannel::open_append(channel.stdout_path())?;
        let stderr_log = OutputChannel::open_append(channel.stderr_path())?;

        flush_std_streams();
        let saved_stdout = io::stdout().as_fd().try_clone_to_owned()?;
        let saved_stderr = io::stderr().as_fd().try_clone_to_owned()?;

        redirect(stdout_log.as_raw_fd(), io::stdout().as_raw_fd())?;
        if let Err(e) = redirect(stderr_log.as_raw_fd(), io::stderr().as_raw_fd()) {
            let _ = redirect(saved_stdout.as_raw_fd(), io::stdout().as_raw_fd());
            return Err(e);
        }

        Ok(Self {
            saved_stdout,
            saved_stderr,
        })
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        flush_std_streams();
        if let Err(e) = redirect(self.saved_stdout.as_raw_fd(), io::stdout().as_raw_fd()) {
            warn!("Failed to restore stdout: {}", e);
        }
        if let Err(e) = redirect(self.saved_stderr.as_raw_fd(), io::stderr().as_raw_fd()) {
            warn!("Failed to restore stderr: {}", e);
        }
    }
}

fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn redirect(from: RawFd, onto: RawFd) -> Result<()> {
    // Safety: both descriptors are open for the duration of the call and dup2
    // does not take ownership of either
    let rc = unsafe { libc::dup2(from, onto) };
    if rc == -1 {
        return Err(CoreError::IoError(io::Error::last_os_error()));
    }
    Ok(())
}

/// Background thread inside a worker that turns the control file into an
/// interrupt.
///
/// On start it removes any control file left over from an earlier run with the
/// same id. It then checks once per [`CONTROL_POLL_INTERVAL`]. When the file
/// shows up it raises the task's interrupt flag; if the task is still running
/// one interval later it raises `SIGINT` on the whole process.
#[derive(Debug)]
pub struct ControlWatcher {
    done: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl ControlWatcher {
    /// Start watching `channel` on behalf of the task owning `ctx`
    pub fn spawn(channel: OutputChannel, ctx: TaskContext) -> Self {
        Self::spawn_with_interval(channel, ctx, CONTROL_POLL_INTERVAL)
    }

    pub(crate) fn spawn_with_interval(
        channel: OutputChannel,
        ctx: TaskContext,
        interval: std::time::Duration,
    ) -> Self {
        let (done, done_rx) = mpsc::channel();
        let handle = std::thread::spawn(move || watch(&channel, &ctx, interval, &done_rx));
        Self { done, handle }
    }

    /// Tell the watcher the task is over and wait for it to exit
    pub fn stop(self) {
        let _ = self.done.send(());
        if self.handle.join().is_err() {
            warn!("Control watcher thread panicked");
        }
    }
}

fn watch(
    channel: &OutputChannel,
    ctx: &TaskContext,
    interval: std::time::Duration,
    done: &mpsc::Receiver<()>,
) {
    if let Err(e) = channel.clear_stop_request() {
        warn!("Could not remove stale control file: {}", e);
    }

    loop {
        match done.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        if channel.stop_requested() {
            break;
        }
    }

    debug!("Stop requested for process {}", ctx.process_id());
    ctx.interrupt();

    match done.recv_timeout(interval) {
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Process {} ignored the stop request, raising SIGINT",
                ctx.process_id()
            );
            flush_std_streams();
            if let Err(e) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT) {
                warn!("Failed to raise SIGINT: {}", e);
            }
        }
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
    }
}
