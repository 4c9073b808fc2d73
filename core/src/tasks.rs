//! Named units of work and the context they run with
//!
//! A child process cannot receive a closure from its parent, so work is looked
//! up by name in a [`TaskTable`] on both sides of the process boundary. The
//! parent only ever ships a [`TaskInvocation`](schema::TaskInvocation).

use anyhow::{anyhow, bail, Context};
use schema::ProcessId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Signature every task implements
pub type TaskFn = fn(&TaskContext, &[String]) -> anyhow::Result<()>;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Raised by [`TaskContext::sleep`] when a stop was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted by stop request")]
pub struct Interrupted;

/// What a running task can see about its surroundings
#[derive(Debug, Clone)]
pub struct TaskContext {
    process_id: ProcessId,
    interrupted: Arc<AtomicBool>,
}

impl TaskContext {
    /// Context for `process_id` sharing the given interrupt flag
    pub fn new(process_id: ProcessId, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            process_id,
            interrupted,
        }
    }

    /// Context whose flag nobody else holds
    pub fn detached(process_id: ProcessId) -> Self {
        Self::new(process_id, Arc::new(AtomicBool::new(false)))
    }

    /// Id of the process this task runs for
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Whether a stop has been requested
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Raise the interrupt flag
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Sleep for `duration`, waking early with [`Interrupted`] on a stop request
    ///
    /// A duration too long to put on the clock sleeps until interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_interrupted() {
                return Err(Interrupted);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(());
                    }
                    SLEEP_SLICE.min(remaining)
                }
                None => SLEEP_SLICE,
            };
            std::thread::sleep(slice);
        }
    }
}

/// Name to task lookup shared by the supervisor and its workers
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: BTreeMap<String, TaskFn>,
}

impl TaskTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, task: TaskFn) -> &mut Self {
        self.tasks.insert(name.into(), task);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, name: impl Into<String>, task: TaskFn) -> Self {
        self.register(name, task);
        self
    }

    /// Look up a task
    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).copied()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

/// Tasks shipped with the `jpm-worker` binary and the `jpm` CLI
pub fn builtin_tasks() -> TaskTable {
    TaskTable::new()
        .with("echo", echo)
        .with("sleep", sleep)
        .with("fail", fail)
        .with("panic", panic_task)
        .with("spin", spin)
        .with("log", log)
}

/// One line per argument on stdout
fn echo(_ctx: &TaskContext, args: &[String]) -> anyhow::Result<()> {
    for arg in args {
        println!("{arg}");
    }
    Ok(())
}

/// `sleep <secs>`: print progress, sleep, print done
fn sleep(ctx: &TaskContext, args: &[String]) -> anyhow::Result<()> {
    let secs: f64 = match args {
        [secs] => secs
            .parse()
            .with_context(|| format!("invalid number of seconds: {secs:?}"))?,
        _ => bail!("usage: sleep <secs>"),
    };
    let duration = Duration::try_from_secs_f64(secs)
        .with_context(|| format!("seconds must be a non-negative number, got {secs}"))?;
    println!("process {} sleeping for {secs} seconds", ctx.process_id());
    ctx.sleep(duration)?;
    println!("process {} done", ctx.process_id());
    Ok(())
}

fn fail(_ctx: &TaskContext, args: &[String]) -> anyhow::Result<()> {
    let message = if args.is_empty() {
        "task failed".to_string()
    } else {
        args.join(" ")
    };
    Err(anyhow!(message))
}

fn panic_task(_ctx: &TaskContext, args: &[String]) -> anyhow::Result<()> {
    panic!("{}", args.join(" "));
}

/// Busy loop that never looks at the interrupt flag
fn spin(_ctx: &TaskContext, _args: &[String]) -> anyhow::Result<()> {
    println!("spinning");
    let mut counter: u64 = 0;
    loop {
        counter = std::hint::black_box(counter.wrapping_add(1));
    }
}

fn log(ctx: &TaskContext, args: &[String]) -> anyhow::Result<()> {
    let message = args.join(" ");
    tracing::info!(process_id = ctx.process_id(), "{}", message);
    eprintln!("{message}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtins_are_registered() {
        let table = builtin_tasks();
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, vec!["echo", "fail", "log", "panic", "sleep", "spin"]);
        assert!(table.contains("sleep"));
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn sleep_returns_early_when_interrupted() {
        let ctx = TaskContext::detached(1);
        ctx.interrupt();
        let started = Instant::now();
        let err = sleep(&ctx, &args(&["30"])).unwrap_err();
        assert!(err.downcast_ref::<Interrupted>().is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_rejects_bad_arguments() {
        let ctx = TaskContext::detached(1);
        assert!(sleep(&ctx, &[]).is_err());
        assert!(sleep(&ctx, &args(&["soon"])).is_err());
        assert!(sleep(&ctx, &args(&["-1"])).is_err());
        assert!(sleep(&ctx, &args(&["NaN"])).is_err());
    }

    #[test]
    fn sleep_rejects_durations_too_large_to_represent() {
        let ctx = TaskContext::detached(1);
        let err = sleep(&ctx, &args(&["1e30"])).unwrap_err();
        assert!(err.to_string().contains("non-negative number"), "{err:#}");
    }

    #[test]
    fn context_sleep_past_the_clock_waits_for_interrupt() {
        let ctx = TaskContext::detached(3);
        let other = ctx.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            other.interrupt();
        });
        assert_eq!(ctx.sleep(Duration::MAX), Err(Interrupted));
        waker.join().unwrap();
    }

    #[test]
    fn context_sleep_completes_without_interrupt() {
        let ctx = TaskContext::detached(2);
        assert_eq!(ctx.sleep(Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn interrupt_is_shared_between_clones() {
        let ctx = TaskContext::detached(4);
        let other = ctx.clone();
        other.interrupt();
        assert!(ctx.is_interrupted());
    }

    #[test]
    fn fail_uses_its_arguments_as_message() {
        let ctx = TaskContext::detached(1);
        let err = fail(&ctx, &args(&["disk", "full"])).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }
}
