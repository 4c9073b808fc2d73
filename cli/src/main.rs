//! jpm command line
//!
//! Runs named tasks as supervised child processes of this command, showing a
//! live status table until they are done. Ctrl-C terminates everything still
//! running.

#![allow(unused_crate_dependencies)]

use clap::{ArgAction, Parser, Subcommand};
use cli::{read_log, refresh_interval, render_status, resolve_config, CliError, LogKind};
use jpm_core::manager::purge_outputs;
use jpm_core::tasks::builtin_tasks;
use jpm_core::{shim, ProcessesManager, TaskInvocation, WaitOutcome, WorkerLauncher};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "jpm")]
#[command(about = "Run tasks as supervised background processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory under which processes_output/ is created
    #[arg(long, global = true, value_name = "DIR")]
    output_root: Option<PathBuf>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a task, possibly several times, and wait for all copies
    Run {
        /// Task name (see `jpm tasks`)
        task: String,
        /// Arguments passed to the task
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Number of copies to start
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Seconds between status refreshes
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
    },
    /// Start one `sleep` task per duration and wait for them
    Batch {
        /// Durations in seconds
        #[arg(long = "sleep", num_args = 1.., required = true, value_name = "SECS")]
        sleeps: Vec<String>,
        /// Seconds between status refreshes
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
    },
    /// Run a task in this process with output captured to its log files
    Debug {
        /// Task name
        task: String,
        /// Arguments passed to the task
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the captured output of a process
    Logs {
        /// Process id
        id: u64,
        /// Show stderr instead of stdout
        #[arg(long, conflicts_with = "errors")]
        stderr: bool,
        /// Show only the error records found in stderr
        #[arg(long)]
        errors: bool,
        /// Only the last N lines
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
    /// List the available tasks
    Tasks,
    /// Delete log files left by earlier sessions
    Purge,
}

fn main() -> ExitCode {
    let table = builtin_tasks();
    shim::run_if_child(&table);

    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    if let Err(e) = jpm_core::utils::init_tracing(level) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("error[{}]: {}", e.code(), e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> cli::Result<ExitCode> {
    let config = resolve_config(cli.config.as_deref(), cli.output_root)?;

    match cli.command {
        Commands::Run {
            task,
            args,
            count,
            interval,
        } => {
            if count == 0 {
                return Err(CliError::InvalidArgument("--count must be at least 1".to_string()));
            }
            let invocations = vec![TaskInvocation::new(task, args); count];
            supervise(config, invocations, interval).await
        }
        Commands::Batch { sleeps, interval } => {
            let invocations = sleeps
                .into_iter()
                .map(|secs| TaskInvocation::new("sleep", [secs]))
                .collect();
            supervise(config, invocations, interval).await
        }
        Commands::Debug { task, args } => {
            let table = builtin_tasks();
            let mut manager = ProcessesManager::new(config, launcher()?)?;
            let result = manager.debug_run(&table, TaskInvocation::new(task, args));
            let id = manager.ids().last();

            if let Some(record) = id.and_then(|id| manager.process(id)) {
                println!("--- stdout of process {} ---", record.id());
                print!("{}", record.stdout_text()?);
                let stderr = record.stderr_text()?;
                if !stderr.is_empty() {
                    println!("--- stderr of process {} ---", record.id());
                    print!("{stderr}");
                }
            }
            result?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs {
            id,
            stderr,
            errors,
            tail,
        } => {
            let kind = if errors {
                LogKind::Errors
            } else if stderr {
                LogKind::Stderr
            } else {
                LogKind::Stdout
            };
            print!("{}", read_log(&config.output_dir(), id, kind, tail)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tasks => {
            for name in builtin_tasks().names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Purge => {
            let removed = purge_outputs(&config.output_dir())?;
            println!("Removed {} files from {}", removed, config.output_dir().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn launcher() -> cli::Result<WorkerLauncher> {
    Ok(WorkerLauncher::current_exe()?.with_tasks(builtin_tasks()))
}

async fn supervise(
    config: jpm_core::ManagerConfig,
    invocations: Vec<TaskInvocation>,
    interval: f64,
) -> cli::Result<ExitCode> {
    let interval = refresh_interval(interval)?;

    let launcher = match &config.worker_executable {
        Some(exe) => WorkerLauncher::new(exe),
        None => launcher()?,
    };
    let mut manager = ProcessesManager::new(config, launcher)?;
    for invocation in invocations {
        let id = manager.submit(invocation)?;
        tracing::info!("Submitted process {}", id);
    }

    let outcome = manager
        .wait_until_all_done_with(
            interval,
            ctrl_c(),
            |snapshot| println!("{}", render_status(snapshot)),
        )
        .await?;

    match outcome {
        WaitOutcome::AllDone => println!("All processes were finished"),
        WaitOutcome::Interrupted => {
            println!("Interrupted, remaining processes were terminated");
            println!("{}", render_status(&manager.snapshot()));
        }
    }
    manager.shutdown_async().await?;

    let failed = manager
        .ids()
        .filter_map(|id| manager.process(id))
        .filter(|record| record.status() == schema::ProcessStatus::Error)
        .count();
    if failed > 0 {
        println!("{failed} processes ended with an error, see `jpm logs <id> --errors`");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
