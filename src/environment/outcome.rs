//! Terminal outcomes of executed runs.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::RunJob;
use crate::experiment::layout::{DRIVER_LOG, OUTCOME_FILE};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Exited with code 0.
    Success,
    /// Exited non-zero, was killed by a signal, or could not be spawned.
    Failed,
    /// Exceeded its wall-clock limit and was killed.
    Timeout,
    /// Never reached the execution backend.
    SubmissionFailed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
            RunStatus::SubmissionFailed => write!(f, "submission_failed"),
        }
    }
}

/// What happened to one run, written to `outcome.json` in its directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    /// Wall-clock seconds between start and termination; `None` when the
    /// run never executed or the backend did not report it.
    pub wall_clock_time: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub message: Option<String>,
}

impl RunOutcome {
    fn new(
        run_id: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
        elapsed: Option<Duration>,
    ) -> Self {
        let finished_at = match elapsed {
            Some(elapsed) => started_at + chrono::Duration::from_std(elapsed).unwrap_or_default(),
            None => Utc::now(),
        };
        Self {
            run_id: run_id.to_string(),
            status,
            exit_code: None,
            wall_clock_time: elapsed.map(|e| e.as_secs_f64()),
            started_at,
            finished_at,
            message: None,
        }
    }

    /// Creates an outcome from a process exit code.
    pub fn exited(
        run_id: &str,
        exit_code: i32,
        started_at: DateTime<Utc>,
        elapsed: Option<Duration>,
    ) -> Self {
        let status = if exit_code == 0 {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let mut outcome = Self::new(run_id, status, started_at, elapsed);
        outcome.exit_code = Some(exit_code);
        outcome
    }

    /// Creates a failed outcome without an exit code.
    pub fn failed(
        run_id: &str,
        started_at: DateTime<Utc>,
        elapsed: Option<Duration>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(run_id, RunStatus::Failed, started_at, elapsed).with_message(message)
    }

    /// Creates an outcome for a run killed at its time limit.
    pub fn timeout(run_id: &str, started_at: DateTime<Utc>, limit: Duration) -> Self {
        Self::new(run_id, RunStatus::Timeout, started_at, Some(limit))
            .with_message(format!("timed out after {}s", limit.as_secs()))
    }

    /// Creates an outcome for a run that never reached the backend.
    pub fn submission_failed(run_id: &str, message: impl Into<String>) -> Self {
        Self::new(run_id, RunStatus::SubmissionFailed, Utc::now(), None)
            .with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Loads the outcome marker from a run directory, if present.
    ///
    /// An unreadable or corrupt marker is logged and treated as missing.
    pub fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(OUTCOME_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Ignoring corrupt outcome marker {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Writes `driver.log` and `outcome.json` into the run's directory.
    ///
    /// The driver log carries the lines patterns usually target, e.g.
    /// `solve wall-clock time: 12.50s`. Runs that never executed get no
    /// wall-clock line, so a pattern on it reports the attribute as missing.
    pub fn write_artifacts(&self, job: &RunJob) -> Result<(), std::io::Error> {
        fs::create_dir_all(&job.work_dir)?;

        let mut driver = fs::File::create(job.work_dir.join(DRIVER_LOG))?;
        writeln!(driver, "{} command: {}", job.name, job.argv.join(" "))?;
        writeln!(driver, "{} started at: {}", job.name, self.started_at.to_rfc3339())?;
        if let Some(code) = self.exit_code {
            writeln!(driver, "{} exit code: {}", job.name, code)?;
        }
        if let Some(ref message) = self.message {
            writeln!(driver, "{} {}", job.name, message)?;
        }
        if let Some(secs) = self.wall_clock_time {
            writeln!(driver, "{} wall-clock time: {:.2}s", job.name, secs)?;
        }
        writeln!(driver, "{} status: {}", job.name, self.status)?;

        let json = serde_json::to_string_pretty(self)?;
        fs::write(job.work_dir.join(OUTCOME_FILE), json)
    }
}
