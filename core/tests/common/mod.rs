//! Shared helpers for tests driving the real `jpm-worker` binary

#![allow(dead_code)]

use jpm_core::tasks::builtin_tasks;
use jpm_core::{ManagerConfig, ProcessId, ProcessStatus, ProcessesManager, WorkerLauncher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Path of the worker binary built alongside these tests
pub fn worker_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_jpm-worker"))
}

/// Config rooted at `root` with the worker binary and a short termination window
pub fn worker_config(root: &Path) -> ManagerConfig {
    ManagerConfig {
        worker_executable: Some(worker_exe()),
        terminate_attempts: 30,
        terminate_poll_millis: 100,
        ..ManagerConfig::with_output_root(root)
    }
}

/// Manager whose launcher knows the built-in tasks
pub fn manager(root: &Path) -> ProcessesManager {
    let launcher = WorkerLauncher::new(worker_exe()).with_tasks(builtin_tasks());
    ProcessesManager::new(worker_config(root), launcher).expect("manager")
}

/// Refresh until `id` is no longer alive and return its final status
pub async fn wait_until_stopped(
    manager: &mut ProcessesManager,
    id: ProcessId,
    timeout: Duration,
) -> ProcessStatus {
    let deadline = Instant::now() + timeout;
    loop {
        manager.refresh_all(usize::MAX);
        if !manager.alive_ids().any(|alive| alive == id) {
            return manager.process(id).expect("record").status();
        }
        assert!(
            Instant::now() < deadline,
            "process {id} still alive after {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll until the stdout log of `id` contains `needle`
pub async fn wait_for_stdout(manager: &ProcessesManager, id: ProcessId, needle: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let text = manager
            .process(id)
            .expect("record")
            .stdout_text()
            .expect("stdout");
        if text.contains(needle) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "stdout of {id} never contained {needle:?}, got {text:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
