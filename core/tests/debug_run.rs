//! Debug runs redirect this process's own stdout and stderr. The libtest
//! harness captures `println!` before it reaches fd 1, so this file runs
//! without it (`harness = false`).

#![allow(unused_crate_dependencies)]

#[cfg(unix)]
fn main() {
    use jpm_core::channel::EMPTY_OUTPUT;
    use jpm_core::tasks::builtin_tasks;
    use jpm_core::{
        CoreError, ManagerConfig, MockLauncher, ProcessStatus, ProcessesManager, TaskInvocation,
    };
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let table = builtin_tasks();
    let mut manager =
        ProcessesManager::new(ManagerConfig::with_output_root(dir.path()), MockLauncher::new())
            .unwrap();

    // Output lands in the record's log
    let id = manager
        .debug_run(&table, TaskInvocation::new("echo", ["captured"]))
        .unwrap();
    let record = manager.process(id).unwrap();
    assert_eq!(record.stdout_text().unwrap(), "captured\n");
    assert_eq!(record.status(), ProcessStatus::NotStarted);
    assert_eq!(manager.alive_count(), 0);
    assert_eq!(manager.total_count(), 1);

    // Failures come back to the caller and leave an error record
    let err = manager
        .debug_run(&table, TaskInvocation::new("fail", ["nope"]))
        .unwrap_err();
    assert!(matches!(err, CoreError::TaskFailed { ref task, .. } if task == "fail"));

    let failed_id = manager.ids().last().unwrap();
    let record = manager.process(failed_id).unwrap();
    let last = record.last_error_message().unwrap().unwrap();
    assert!(last.contains("task 'fail' failed: nope"));
    assert_eq!(manager.total_count(), 2);
    assert_eq!(manager.alive_count(), 0);

    // Streams are restored afterwards
    println!("debug_run: streams restored");
    assert_eq!(record.stdout_text().unwrap(), EMPTY_OUTPUT);

    // A panic is caught, classified and reported like a failure
    let err = manager
        .debug_run(&table, TaskInvocation::new("panic", ["kaboom"]))
        .unwrap_err();
    assert!(
        matches!(err, CoreError::TaskFailed { ref task, ref message } if task == "panic" && message.contains("kaboom"))
    );
    let panicked_id = manager.ids().last().unwrap();
    let errors = manager.process(panicked_id).unwrap().all_error_messages().unwrap();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("task 'panic' panicked: kaboom"));
    assert_eq!(manager.alive_count(), 0);
    println!("debug_run: ok");
}

#[cfg(not(unix))]
fn main() {}
