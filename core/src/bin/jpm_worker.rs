//! Worker host for the built-in tasks.
//!
//! Started by a supervisor as `jpm-worker __jpm-child <id> <output-dir> <task> [args...]`.
//! Run by hand it lists what it can do.

#![allow(unused_crate_dependencies)]

use jpm_core::{shim, tasks};
use std::process::ExitCode;

fn main() -> ExitCode {
    let table = tasks::builtin_tasks();
    shim::run_if_child(&table);

    eprintln!("jpm-worker is started by the jpm supervisor, not directly.");
    eprintln!("Available tasks:");
    for name in table.names() {
        eprintln!("  {name}");
    }
    ExitCode::from(shim::EXIT_BAD_INVOCATION as u8)
}
