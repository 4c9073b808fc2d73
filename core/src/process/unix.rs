//! Unix child processes living in their own process group
//!
//! Every worker is started with `setsid()` in `pre_exec`, which makes it the
//! leader of a fresh session and process group. Killing the group with
//! `killpg` then also takes down anything the task itself spawned.
//!
//! The parent never blocks on a child here: liveness is polled with
//! `try_wait`, and a forced stop is a single `SIGKILL` to the group.

// setsid() in pre_exec needs unsafe
#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;
use std::ffi::OsStr;
use std::fs::File;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// A spawned child that leads its own process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    child: Child,
}

impl ChildProcess {
    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking exit check. `None` while the child is still running.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().map_err(|e| {
            CoreError::ProcessWait(format!(
                "Failed to try_wait for process {}: {}",
                self.pid, e
            ))
        })
    }
}

/// Spawn `program` with `args` in a new process group.
///
/// Stdin is closed. Stdout and stderr go to the given files, so anything the
/// child prints before it installs its own redirection still lands in the
/// logs. The child is killed if its handle is dropped.
///
/// Must be called from within a tokio runtime.
pub fn spawn_in_group<I, S>(program: &Path, args: I, stdout: File, stderr: File) -> Result<ChildProcess>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(CoreError::ProcessSpawn(
            "Child processes can only be spawned inside a tokio runtime".to_string(),
        ));
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    // Safety: setsid() is async-signal-safe and is the only call made between fork and exec
    #[deny(unsafe_op_in_unsafe_fn)]
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn '{}': {}", program.display(), e);
        CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", program.display(), e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Spawned {} as pid {} in a new process group", program.display(), pid);

    Ok(ChildProcess { pid, child })
}

/// Send `signal` to the child's whole process group.
///
/// A group that no longer exists (`ESRCH`) or that we may no longer signal
/// (`EPERM`, usually a reused id) counts as already gone.
pub fn signal_group(child: &ChildProcess, signal: Signal) -> Result<()> {
    match killpg(child.pid, signal) {
        Ok(()) => {
            debug!("Sent {} to process group {}", signal, child.pid);
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!("Process group {} already exited", child.pid);
            Ok(())
        }
        Err(nix::errno::Errno::EPERM) => {
            debug!(
                "Permission denied signaling process group {} (likely already exited)",
                child.pid
            );
            Ok(())
        }
        Err(e) => {
            error!("Failed to send {} to process group {}: {}", signal, child.pid, e);
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {} to process group {}: {}",
                signal, child.pid, e
            )))
        }
    }
}

/// Forcefully stop the child's process group with `SIGKILL`
pub fn kill_group(child: &ChildProcess) -> Result<()> {
    signal_group(child, Signal::SIGKILL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    async fn wait_for_exit(child: &mut ChildProcess) -> ExitStatus {
        loop {
            if let Some(status) = child.try_wait().unwrap() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn log_files(dir: &Path) -> (File, File) {
        (
            File::create(dir.join("out.txt")).unwrap(),
            File::create(dir.join("err.txt")).unwrap(),
        )
    }

    #[tokio::test]
    async fn child_leads_its_own_group() {
        let dir = tempdir().unwrap();
        let (out, err) = log_files(dir.path());
        let mut child = spawn_in_group(Path::new("sleep"), ["1"], out, err).unwrap();
        assert!(child.pid() > 0);
        assert_eq!(
            nix::unistd::getpgid(Some(Pid::from_raw(child.pid() as i32))).unwrap(),
            Pid::from_raw(child.pid() as i32)
        );
        kill_group(&child).unwrap();
        wait_for_exit(&mut child).await;
    }

    #[tokio::test]
    async fn output_goes_to_the_given_files() {
        let dir = tempdir().unwrap();
        let (out, err) = log_files(dir.path());
        let mut child = spawn_in_group(Path::new("echo"), ["hello"], out, err).unwrap();
        assert!(wait_for_exit(&mut child).await.success());
        let text = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(text, "hello\n");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let (out, err) = log_files(dir.path());
        let result = spawn_in_group(Path::new("nonexistent_command_12345"), Vec::<String>::new(), out, err);
        match result {
            Err(CoreError::ProcessSpawn(_)) => {}
            other => panic!("Expected ProcessSpawn error, got: {:?}", other.map(|c| c.pid())),
        }
    }

    #[test]
    fn spawning_outside_a_runtime_is_refused() {
        let dir = tempdir().unwrap();
        let (out, err) = log_files(dir.path());
        let result = spawn_in_group(Path::new("true"), Vec::<String>::new(), out, err);
        assert!(matches!(result, Err(CoreError::ProcessSpawn(_))));
    }

    #[tokio::test]
    async fn kill_group_stops_a_running_child() {
        let dir = tempdir().unwrap();
        let (out, err) = log_files(dir.path());
        let mut child = spawn_in_group(Path::new("sleep"), ["30"], out, err).unwrap();
        assert!(child.try_wait().unwrap().is_none());

        kill_group(&child).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            assert!(Instant::now() < deadline, "child survived SIGKILL");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert!(!status.success());

        // Group is gone now; signalling it again is not an error
        kill_group(&child).unwrap();
    }
}
