//! Presentation layer for the jpm supervisor: config resolution, status
//! tables and log viewing

pub mod error;

pub use error::{CliError, Result};

use jpm_core::channel::OutputChannel;
use jpm_core::record::tail_lines;
use jpm_core::{load_config_from_toml_path, ManagerConfig, ProcessId};
use schema::{StatusRow, StatusSnapshot};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// One line of the status table
#[derive(Debug, Clone, Tabled)]
struct TableRow {
    #[tabled(rename = "Process Id")]
    pid: String,
    #[tabled(rename = "Output Id")]
    output_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Runtime")]
    runtime: String,
    #[tabled(rename = "RAM memory")]
    memory: String,
}

impl From<&StatusRow> for TableRow {
    fn from(row: &StatusRow) -> Self {
        match row {
            StatusRow::Process(p) => Self {
                pid: p
                    .os_pid
                    .map_or_else(|| "None".to_string(), |pid| pid.to_string()),
                output_id: p.process_id.to_string(),
                status: p.status.to_string(),
                runtime: p.running_duration.clone(),
                memory: p.memory_usage.clone(),
            },
            StatusRow::Hidden { count } => Self {
                pid: "---".to_string(),
                output_id: "---".to_string(),
                status: format!("{count} processes hidden"),
                runtime: "---".to_string(),
                memory: "---".to_string(),
            },
        }
    }
}

/// Render the rows of `snapshot` as a table
pub fn render_table(snapshot: &StatusSnapshot) -> String {
    let rows: Vec<TableRow> = snapshot.rows.iter().map(TableRow::from).collect();
    Table::new(rows)
        .with(Style::modern().remove_horizontals())
        .to_string()
}

/// Full status report: running time, table and alive counter
pub fn render_status(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    if let Some(working_for) = &snapshot.working_for {
        out.push_str(&format!("Working for: {working_for}\n"));
    }
    if snapshot.rows.is_empty() {
        out.push_str("No processes started yet\n");
    } else {
        out.push_str(&render_table(snapshot));
        out.push('\n');
    }
    out.push_str(&format!(
        "ALIVE PROCESSES: {} / {}\n",
        snapshot.alive_count, snapshot.total_count
    ));
    out
}

/// Resolve the effective config: file (or defaults), then `JPM_OUTPUT_ROOT`,
/// then an explicit `--output-root`
pub fn resolve_config(config_path: Option<&Path>, output_root: Option<PathBuf>) -> Result<ManagerConfig> {
    let config = match config_path {
        Some(path) => load_config_from_toml_path(path)
            .map_err(|e| CliError::ConfigError(format!("{}: {}", path.display(), e)))?,
        None => ManagerConfig::default(),
    };
    let mut config = config.apply_env_overrides();
    if let Some(root) = output_root {
        config.output_root = root;
    }
    config.validate()?;
    Ok(config)
}

/// Status refresh period from `--interval` seconds
pub fn refresh_interval(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(interval) if !interval.is_zero() => Ok(interval),
        _ => Err(CliError::InvalidArgument(format!(
            "--interval must be a positive number of seconds, got {secs}"
        ))),
    }
}

/// Which log of a process to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Captured stdout
    Stdout,
    /// Captured stderr
    Stderr,
    /// Error records split out of stderr
    Errors,
}

/// Read the surviving log of process `id` from `output_dir`
pub fn read_log(output_dir: &Path, id: ProcessId, kind: LogKind, tail: Option<usize>) -> Result<String> {
    let channel = OutputChannel::new(output_dir, id);
    if !channel.stdout_path().exists() && !channel.stderr_path().exists() {
        return Err(CliError::NoOutput(id));
    }

    let text = match kind {
        LogKind::Stdout => channel.read_stdout()?,
        LogKind::Stderr => channel.read_stderr()?,
        LogKind::Errors => channel.error_records()?.concat(),
    };
    Ok(match tail {
        Some(n) => tail_lines(&text, n),
        None => text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{ProcessRow, ProcessStatus};
    use std::fs;
    use tempfile::tempdir;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            rows: vec![
                StatusRow::Process(ProcessRow {
                    os_pid: Some(4242),
                    process_id: 1,
                    status: ProcessStatus::Running,
                    running_duration: "5 seconds".to_string(),
                    memory_usage: "12 MB".to_string(),
                }),
                StatusRow::Hidden { count: 3 },
                StatusRow::Process(ProcessRow {
                    os_pid: None,
                    process_id: 5,
                    status: ProcessStatus::TerminatedByUser,
                    running_duration: "1 minute, 2 seconds".to_string(),
                    memory_usage: "None".to_string(),
                }),
            ],
            alive_count: 1,
            total_count: 5,
            working_for: Some("1 minute, 3 seconds".to_string()),
        }
    }

    #[test]
    fn table_has_the_expected_headers_and_rows() {
        let table = render_table(&snapshot());
        for header in ["Process Id", "Output Id", "Status", "Runtime", "RAM memory"] {
            assert!(table.contains(header), "missing {header} in\n{table}");
        }
        assert!(table.contains("4242"));
        assert!(table.contains("3 processes hidden"));
        assert!(table.contains("Terminated by user"));
    }

    #[test]
    fn status_report_has_counter_and_clock() {
        let report = render_status(&snapshot());
        assert!(report.starts_with("Working for: 1 minute, 3 seconds\n"));
        assert!(report.ends_with("ALIVE PROCESSES: 1 / 5\n"));
    }

    #[test]
    fn empty_report() {
        let report = render_status(&StatusSnapshot::default());
        assert_eq!(report, "No processes started yet\nALIVE PROCESSES: 0 / 0\n");
    }

    #[test]
    fn output_root_flag_wins() {
        let config = resolve_config(None, Some(PathBuf::from("/tmp/elsewhere"))).unwrap();
        assert_eq!(config.output_root, PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jpm.toml");
        fs::write(&path, "maxRows = 4\nterminateAttempts = 3\n").unwrap();
        let config = resolve_config(Some(&path), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.max_rows, 4);
        assert_eq!(config.terminate_attempts, 3);
    }

    #[test]
    fn broken_config_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jpm.toml");
        fs::write(&path, "maxRows = 0\n").unwrap();
        let err = resolve_config(Some(&path), None).unwrap_err();
        assert!(matches!(err, CliError::ConfigError(_)));
    }

    #[test]
    fn refresh_interval_bounds() {
        assert_eq!(refresh_interval(0.5).unwrap(), Duration::from_millis(500));
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(
                matches!(refresh_interval(bad), Err(CliError::InvalidArgument(_))),
                "{bad} was accepted"
            );
        }
    }

    #[test]
    fn logs_are_read_back() {
        let dir = tempdir().unwrap();
        let channel = OutputChannel::new(dir.path(), 2);
        channel.create().unwrap();
        fs::write(channel.stdout_path(), "a\nb\nc\n").unwrap();
        fs::write(
            channel.stderr_path(),
            "noise\nTraceback (most recent call last):\n  boom\n",
        )
        .unwrap();

        assert_eq!(read_log(dir.path(), 2, LogKind::Stdout, None).unwrap(), "a\nb\nc\n");
        assert_eq!(read_log(dir.path(), 2, LogKind::Stdout, Some(2)).unwrap(), "b\nc");
        assert_eq!(
            read_log(dir.path(), 2, LogKind::Errors, None).unwrap(),
            "Traceback (most recent call last):\n  boom\n"
        );
        assert!(matches!(
            read_log(dir.path(), 9, LogKind::Stderr, None),
            Err(CliError::NoOutput(9))
        ));
    }
}
