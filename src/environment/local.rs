//! Local execution on a bounded pool of child processes.

use std::fs::File;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{Environment, RunJob, RunOutcome};
use crate::error::EnvironmentError;
use crate::experiment::layout::{RUN_ERR, RUN_LOG};

/// Runs jobs as local child processes, at most `processes` at a time.
pub struct LocalEnvironment {
    processes: usize,
    default_time_limit: Duration,
    kill_margin: Duration,
}

impl LocalEnvironment {
    /// Default wall-clock limit for runs that do not declare one.
    pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(1800);

    /// Grace period past the run limit before the process is killed.
    pub const DEFAULT_KILL_MARGIN: Duration = Duration::from_secs(5);

    /// Creates a local environment with the given pool width.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::InvalidConfig` if `processes` is zero.
    pub fn new(processes: usize) -> Result<Self, EnvironmentError> {
        if processes == 0 {
            return Err(EnvironmentError::InvalidConfig(
                "processes must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            processes,
            default_time_limit: Self::DEFAULT_TIME_LIMIT,
            kill_margin: Self::DEFAULT_KILL_MARGIN,
        })
    }

    /// Sets the limit applied to runs without their own time limit.
    pub fn with_default_time_limit(mut self, limit: Duration) -> Self {
        self.default_time_limit = limit;
        self
    }

    /// Sets the grace period a run gets past its limit, so a solver that
    /// enforces the limit itself can still print its final status.
    pub fn with_kill_margin(mut self, margin: Duration) -> Self {
        self.kill_margin = margin;
        self
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    pub fn kill_margin(&self) -> Duration {
        self.kill_margin
    }

    fn spawn(&self, job: &RunJob) -> Result<Child, std::io::Error> {
        let (program, args) = job.argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;

        std::fs::create_dir_all(&job.work_dir)?;
        let stdout = File::create(job.work_dir.join(RUN_LOG))?;
        let stderr = File::create(job.work_dir.join(RUN_ERR))?;

        Command::new(program)
            .args(args)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
    }

    async fn run_job(&self, job: &RunJob) -> RunOutcome {
        let limit = job.time_limit.unwrap_or(self.default_time_limit);
        let deadline = limit + self.kill_margin;
        let started_at = Utc::now();
        let start = Instant::now();

        debug!("Starting run {}: {}", job.run_id, job.argv.join(" "));

        let outcome = match self.spawn(job) {
            Err(e) => RunOutcome::failed(
                &job.run_id,
                started_at,
                None,
                format!("failed to spawn: {}", e),
            ),
            Ok(mut child) => match tokio::time::timeout(deadline, child.wait()).await {
                Ok(Ok(status)) => match status.code() {
                    Some(code) => {
                        RunOutcome::exited(&job.run_id, code, started_at, Some(start.elapsed()))
                    }
                    None => RunOutcome::failed(
                        &job.run_id,
                        started_at,
                        Some(start.elapsed()),
                        "terminated by signal",
                    ),
                },
                Ok(Err(e)) => RunOutcome::failed(
                    &job.run_id,
                    started_at,
                    Some(start.elapsed()),
                    format!("failed to wait for process: {}", e),
                ),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill timed out run {}: {}", job.run_id, e);
                    }
                    RunOutcome::timeout(&job.run_id, started_at, limit)
                }
            },
        };

        if let Err(e) = outcome.write_artifacts(job) {
            warn!("Failed to record outcome of run {}: {}", job.run_id, e);
        }

        match outcome.wall_clock_time {
            Some(secs) => info!("Run {} finished: {} in {:.2}s", job.run_id, outcome.status, secs),
            None => info!("Run {} finished: {}", job.run_id, outcome.status),
        }
        outcome
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, jobs: &[RunJob]) -> Result<Vec<RunOutcome>, EnvironmentError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Executing {} runs locally with {} processes",
            jobs.len(),
            self.processes
        );

        let limiter = Arc::new(Semaphore::new(self.processes));

        let futures: Vec<_> = jobs
            .iter()
            .map(|job| {
                let limiter = Arc::clone(&limiter);
                async move {
                    match limiter.acquire().await {
                        Ok(_permit) => self.run_job(job).await,
                        Err(e) => RunOutcome::submission_failed(
                            &job.run_id,
                            format!("failed to acquire worker: {}", e),
                        ),
                    }
                }
            })
            .collect();

        // Barrier: returns once every run is terminal.
        Ok(futures::future::join_all(futures).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::RunStatus;
    use crate::experiment::layout::DRIVER_LOG;
    use std::path::Path;
    use tempfile::TempDir;

    fn shell_job(root: &Path, id: &str, script: &str, limit: Option<Duration>) -> RunJob {
        RunJob {
            run_id: id.to_string(),
            name: "solve".to_string(),
            argv: vec!["sh".into(), "-c".into(), script.into()],
            time_limit: limit,
            work_dir: root.join(id),
        }
    }

    #[test]
    fn test_zero_processes_rejected() {
        assert!(LocalEnvironment::new(0).is_err());
    }

    #[tokio::test]
    async fn test_statuses_and_artifacts() {
        let temp = TempDir::new().unwrap();
        let env = LocalEnvironment::new(2)
            .unwrap()
            .with_kill_margin(Duration::from_millis(100));
        let jobs = vec![
            shell_job(temp.path(), "ok", "echo 's OPTIMAL'", None),
            shell_job(temp.path(), "bad", "echo oops >&2; exit 3", None),
            shell_job(temp.path(), "slow", "sleep 5", Some(Duration::from_millis(200))),
            RunJob {
                argv: vec!["/nonexistent/solver-binary".into()],
                ..shell_job(temp.path(), "missing", "", None)
            },
        ];

        let outcomes = env.execute(&jobs).await.unwrap();
        assert_eq!(outcomes.len(), 4);

        assert_eq!(outcomes[0].run_id, "ok");
        assert_eq!(outcomes[0].status, RunStatus::Success);
        let stdout = std::fs::read_to_string(jobs[0].work_dir.join(RUN_LOG)).unwrap();
        assert_eq!(stdout.trim(), "s OPTIMAL");

        assert_eq!(outcomes[1].status, RunStatus::Failed);
        assert_eq!(outcomes[1].exit_code, Some(3));
        let stderr = std::fs::read_to_string(jobs[1].work_dir.join(RUN_ERR)).unwrap();
        assert_eq!(stderr.trim(), "oops");

        assert_eq!(outcomes[2].status, RunStatus::Timeout);
        let driver = std::fs::read_to_string(jobs[2].work_dir.join(DRIVER_LOG)).unwrap();
        assert!(driver.contains("solve wall-clock time:"));

        assert_eq!(outcomes[3].status, RunStatus::Failed);
        assert!(outcomes[3].message.as_deref().unwrap().contains("spawn"));
        assert_eq!(outcomes[3].wall_clock_time, None);
        assert!(RunOutcome::load(&jobs[3].work_dir).is_some());
        let driver = std::fs::read_to_string(jobs[3].work_dir.join(DRIVER_LOG)).unwrap();
        assert!(!driver.contains("wall-clock time"));
    }

    #[tokio::test]
    async fn test_kill_margin_lets_run_finish() {
        let temp = TempDir::new().unwrap();
        let env = LocalEnvironment::new(1)
            .unwrap()
            .with_kill_margin(Duration::from_secs(5));
        // Overruns its limit slightly, as a solver flushing its final status would.
        let jobs = vec![shell_job(
            temp.path(),
            "late",
            "sleep 0.4; echo 's SATISFIABLE'",
            Some(Duration::from_millis(100)),
        )];

        let outcomes = env.execute(&jobs).await.unwrap();
        assert_eq!(outcomes[0].status, RunStatus::Success);
        let stdout = std::fs::read_to_string(jobs[0].work_dir.join(RUN_LOG)).unwrap();
        assert_eq!(stdout.trim(), "s SATISFIABLE");
    }

    #[tokio::test]
    async fn test_pool_bounds_wall_clock() {
        let temp = TempDir::new().unwrap();
        let env = LocalEnvironment::new(2).unwrap();
        let jobs: Vec<_> = (0..5)
            .map(|i| shell_job(temp.path(), &format!("r{}", i), "sleep 0.3", None))
            .collect();

        let start = Instant::now();
        let outcomes = env.execute(&jobs).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.is_success()));
        // ceil(5 / 2) * 0.3s, with generous slack for process startup.
        assert!(elapsed < Duration::from_millis(900 + 1500), "took {:?}", elapsed);
        // With only two workers the batch cannot finish in one round.
        assert!(elapsed >= Duration::from_millis(600), "took {:?}", elapsed);
    }
}
