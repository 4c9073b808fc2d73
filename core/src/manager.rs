//! The registry of every process started in one session
//!
//! [`ProcessesManager`] owns the shared output directory, hands out ids via the
//! [`IdAllocator`], and keeps two views of its records: every record in
//! creation order, and the ids still believed alive. A record leaves the alive
//! set the first time it is seen not running and never comes back.
//!
//! All mutating operations take `&mut self`, so a manager shared between
//! threads has to sit behind a lock.

use crate::allocator::IdAllocator;
use crate::channel::is_channel_file;
use crate::config::ManagerConfig;
use crate::format::format_duration;
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::record::ProcessRecord;
use crate::tasks::TaskTable;
use crate::{CoreError, Result};
use schema::{ProcessId, StatusRow, StatusSnapshot, TaskInvocation};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest single sleep inside [`ProcessesManager::wait_until_all_done`]
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every process stopped on its own
    AllDone,
    /// The wait was cancelled and the remaining processes were terminated
    Interrupted,
}

/// Registry of supervised processes
pub struct ProcessesManager {
    config: ManagerConfig,
    output_dir: PathBuf,
    launcher: Box<dyn ProcessLauncher>,
    allocator: IdAllocator,
    all: BTreeMap<ProcessId, ProcessRecord>,
    alive: BTreeSet<ProcessId>,
    started_at: Option<Instant>,
    shut_down: bool,
}

impl std::fmt::Debug for ProcessesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessesManager")
            .field("output_dir", &self.output_dir)
            .field("total", &self.all.len())
            .field("alive", &self.alive)
            .finish()
    }
}

impl ProcessesManager {
    /// Create the output directory (purging old logs if configured) and an
    /// empty registry starting children through `launcher`
    pub fn new(config: ManagerConfig, launcher: impl ProcessLauncher + 'static) -> Result<Self> {
        config.validate()?;
        let output_dir = config.output_dir();
        fs::create_dir_all(&output_dir)
            .map_err(|e| CoreError::io_at(&output_dir, "create output directory", e))?;

        if config.purge_previous_outputs {
            let removed = purge_outputs(&output_dir)?;
            if removed > 0 {
                info!("Removed {} old output files from {}", removed, output_dir.display());
            }
        }

        debug!("Process manager ready in {}", output_dir.display());
        Ok(Self {
            allocator: IdAllocator::new(&output_dir),
            output_dir,
            config,
            launcher: Box::new(launcher),
            all: BTreeMap::new(),
            alive: BTreeSet::new(),
            started_at: None,
            shut_down: false,
        })
    }

    /// Registry whose children re-execute `config.worker_executable`, or the
    /// current executable when none is configured
    pub fn with_worker(config: ManagerConfig) -> Result<Self> {
        let launcher = match &config.worker_executable {
            Some(exe) => WorkerLauncher::new(exe),
            None => WorkerLauncher::current_exe()?,
        };
        Self::new(config, launcher)
    }

    /// Start `invocation` in a new child process and return its id
    pub fn submit(&mut self, invocation: TaskInvocation) -> Result<ProcessId> {
        if self.launcher.knows_task(&invocation.task) == Some(false) {
            return Err(CoreError::UnknownTask(invocation.task));
        }

        let id = self.allocator.reserve_next()?;
        let mut record = ProcessRecord::create(id, &self.output_dir)?;
        record.start(self.launcher.as_ref(), invocation)?;

        if self.alive.is_empty() {
            self.started_at = Some(Instant::now());
        }
        self.all.insert(id, record);
        self.alive.insert(id);
        Ok(id)
    }

    /// Run `invocation` from `table` synchronously in this process, with
    /// output captured in a new record's logs. The record is kept but never
    /// counts as alive.
    pub fn debug_run(&mut self, table: &TaskTable, invocation: TaskInvocation) -> Result<ProcessId> {
        if !table.contains(&invocation.task) {
            return Err(CoreError::UnknownTask(invocation.task));
        }

        let id = self.allocator.reserve_next()?;
        let record = ProcessRecord::create(id, &self.output_dir)?;
        let record = self.all.entry(id).or_insert(record);
        record.debug_run(table, invocation)?;
        Ok(id)
    }

    /// Refresh every record still listed as alive and build a status table of
    /// at most `limit` process rows.
    ///
    /// When there are more records than `limit`, the middle ones are replaced
    /// by a single [`StatusRow::Hidden`]. Every alive record is polled either way.
    pub fn refresh_all(&mut self, limit: usize) -> StatusSnapshot {
        for (id, record) in self.all.iter_mut() {
            if !self.alive.contains(id) {
                continue;
            }
            match record.refresh_status() {
                Ok(true) => {}
                Ok(false) => {
                    self.alive.remove(id);
                }
                Err(e) => warn!("Failed to refresh process {}: {}", id, e),
            }
        }

        let rows: Vec<StatusRow> = self
            .all
            .values()
            .map(|record| StatusRow::Process(record.row()))
            .collect();

        StatusSnapshot {
            rows: elide_middle(rows, limit),
            alive_count: self.alive.len(),
            total_count: self.all.len(),
            working_for: self.working_for(),
        }
    }

    /// [`refresh_all`](Self::refresh_all) with the configured row limit
    pub fn snapshot(&mut self) -> StatusSnapshot {
        self.refresh_all(self.config.max_rows)
    }

    /// Terminate one process
    pub fn terminate(&mut self, id: ProcessId) -> Result<()> {
        let attempts = self.config.terminate_attempts;
        let poll = self.config.terminate_poll();
        let record = self.all.get_mut(&id).ok_or(CoreError::UnknownProcess(id))?;

        let result = record.terminate(attempts, poll);
        if record.status().is_terminal() {
            self.alive.remove(&id);
        }
        result
    }

    /// [`terminate`](Self::terminate) without blocking the runtime thread
    pub async fn terminate_async(&mut self, id: ProcessId) -> Result<()> {
        let attempts = self.config.terminate_attempts;
        let poll = self.config.terminate_poll();
        let record = self.all.get_mut(&id).ok_or(CoreError::UnknownProcess(id))?;

        let result = record.terminate_async(attempts, poll).await;
        if record.status().is_terminal() {
            self.alive.remove(&id);
        }
        result
    }

    /// Terminate every process still listed as alive, one after the other.
    ///
    /// Keeps going when one of them fails and returns the first failure.
    /// Blocks the calling thread; inside a runtime use
    /// [`terminate_all_async`](Self::terminate_all_async).
    pub fn terminate_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for id in self.ids_to_terminate() {
            if let Err(e) = self.terminate(id) {
                warn!("Failed to terminate process {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// [`terminate_all`](Self::terminate_all) without blocking the runtime thread
    pub async fn terminate_all_async(&mut self) -> Result<()> {
        let mut first_error = None;
        for id in self.ids_to_terminate() {
            if let Err(e) = self.terminate_async(id).await {
                warn!("Failed to terminate process {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ids_to_terminate(&self) -> Vec<ProcessId> {
        let ids: Vec<ProcessId> = self.alive.iter().copied().collect();
        if !ids.is_empty() {
            info!("Terminating {} alive processes", ids.len());
        }
        ids
    }

    /// Poll until nothing is alive, terminating everything on Ctrl-C
    pub async fn wait_until_all_done(&mut self, poll_interval: Duration) -> Result<WaitOutcome> {
        self.wait_until_all_done_or(poll_interval, ctrl_c()).await
    }

    /// Poll until nothing is alive or `cancel` completes; on cancellation every
    /// remaining process is terminated
    pub async fn wait_until_all_done_or<F>(&mut self, poll_interval: Duration, cancel: F) -> Result<WaitOutcome>
    where
        F: Future<Output = ()>,
    {
        self.wait_until_all_done_with(poll_interval, cancel, |_| {}).await
    }

    /// Like [`wait_until_all_done_or`](Self::wait_until_all_done_or), handing
    /// every refreshed snapshot to `on_refresh`
    pub async fn wait_until_all_done_with<F, R>(
        &mut self,
        poll_interval: Duration,
        cancel: F,
        mut on_refresh: R,
    ) -> Result<WaitOutcome>
    where
        F: Future<Output = ()>,
        R: FnMut(&StatusSnapshot),
    {
        tokio::pin!(cancel);
        loop {
            let snapshot = self.snapshot();
            on_refresh(&snapshot);
            if snapshot.all_done() {
                return Ok(WaitOutcome::AllDone);
            }

            // An interval too long for the clock only ends on cancellation
            let deadline = Instant::now().checked_add(poll_interval);
            loop {
                let slice = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        WAIT_SLICE.min(remaining)
                    }
                    None => WAIT_SLICE,
                };
                tokio::select! {
                    _ = &mut cancel => {
                        info!("Wait interrupted, terminating remaining processes");
                        self.terminate_all_async().await?;
                        return Ok(WaitOutcome::Interrupted);
                    }
                    _ = tokio::time::sleep(slice) => {}
                }
            }
        }
    }

    /// Terminate everything still running. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.terminate_all()
    }

    /// [`shutdown`](Self::shutdown) without blocking the runtime thread
    pub async fn shutdown_async(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.terminate_all_async().await
    }

    /// Record for `id`
    pub fn process(&self, id: ProcessId) -> Option<&ProcessRecord> {
        self.all.get(&id)
    }

    /// Every id in creation order
    pub fn ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.all.keys().copied()
    }

    /// Ids still believed alive
    pub fn alive_ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.alive.iter().copied()
    }

    /// Number of processes still believed alive
    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    /// Number of records ever created
    pub fn total_count(&self) -> usize {
        self.all.len()
    }

    /// Time since the current batch started, formatted
    pub fn working_for(&self) -> Option<String> {
        self.started_at.map(|at| format_duration(at.elapsed()))
    }

    /// Shared output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

impl Drop for ProcessesManager {
    fn drop(&mut self) {
        for id in std::mem::take(&mut self.alive) {
            if let Some(record) = self.all.get_mut(&id) {
                if let Err(e) = record.kill_now() {
                    warn!("Failed to kill process {} during teardown: {}", id, e);
                }
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Keep the first `limit / 2` and last `limit - limit / 2` rows, replacing the
/// rest with one hidden-rows marker. A `limit` of 0 keeps every row.
pub fn elide_middle(mut rows: Vec<StatusRow>, limit: usize) -> Vec<StatusRow> {
    if limit == 0 || rows.len() <= limit {
        return rows;
    }
    let head = limit / 2;
    let tail = limit - head;
    let hidden = rows.len() - limit;

    let tail_rows = rows.split_off(rows.len() - tail);
    rows.truncate(head);
    rows.push(StatusRow::Hidden { count: hidden });
    rows.extend(tail_rows);
    rows
}

/// Delete the log and control files of earlier sessions from `dir`.
///
/// Files that cannot be removed are reported and skipped. Returns how many
/// files were removed.
pub fn purge_outputs(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CoreError::io_at(dir, "list", e)),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_channel_file(name) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Can't delete previous output file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
