//! Cluster execution through a job-array scheduler.
//!
//! The batch is serialized into one array submission script, handed to a
//! [`Scheduler`] adapter and polled until every array task is terminal. The
//! adapter owns the mechanics of a concrete scheduler (command-line tools,
//! REST API, ...); this module only depends on its submit/poll contract.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Environment, RunJob, RunOutcome};
use crate::error::{ConfigError, EnvironmentError, SchedulerError};
use crate::experiment::layout::{RUN_ERR, RUN_LOG};

/// Scheduler-reported state of one array task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Running,
    Completed {
        exit_code: i32,
        elapsed: Option<Duration>,
    },
    TimedOut {
        elapsed: Option<Duration>,
    },
    Failed {
        message: String,
    },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// Adapter contract for a concrete cluster scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submits the job array and returns the scheduler's job id.
    async fn submit(&self, job: &JobArray) -> Result<String, SchedulerError>;

    /// Returns the state of every task, in submission order.
    async fn poll(&self, job_id: &str) -> Result<Vec<TaskState>, SchedulerError>;
}

/// Configuration for cluster submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of the submitted job array.
    pub job_name: String,
    /// Scheduler partition (queue), if any.
    pub partition: Option<String>,
    /// CPUs reserved per array task.
    pub cpus_per_task: u32,
    /// Memory per CPU in MB, if any.
    pub memory_per_cpu_mb: Option<u64>,
    /// Limit for runs that do not declare one.
    pub default_time_limit: Duration,
    /// Slack added to the scheduler time limit on top of the run limit.
    pub time_limit_margin: Duration,
    /// Maximum number of array tasks running at once.
    pub max_parallel_tasks: Option<usize>,
    /// Extra header lines appended verbatim after the generated ones.
    pub extra_directives: Vec<String>,
    /// Delay between two polls.
    pub poll_interval: Duration,
    /// Consecutive poll failures tolerated before giving up.
    pub max_poll_failures: u32,
    /// Where the submission script is written.
    pub script_path: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            job_name: "solver-lab".to_string(),
            partition: None,
            cpus_per_task: 1,
            memory_per_cpu_mb: None,
            default_time_limit: Duration::from_secs(1800),
            time_limit_margin: Duration::from_secs(60),
            max_parallel_tasks: None,
            extra_directives: Vec::new(),
            poll_interval: Duration::from_secs(30),
            max_poll_failures: 5,
            script_path: PathBuf::from("job-array.sh"),
        }
    }
}

impl ClusterConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_cpus_per_task(mut self, cpus: u32) -> Self {
        self.cpus_per_task = cpus;
        self
    }

    pub fn with_memory_per_cpu_mb(mut self, mb: u64) -> Self {
        self.memory_per_cpu_mb = Some(mb);
        self
    }

    pub fn with_default_time_limit(mut self, limit: Duration) -> Self {
        self.default_time_limit = limit;
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = Some(max);
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.extra_directives.push(directive.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_failures(mut self, max: u32) -> Self {
        self.max_poll_failures = max;
        self
    }

    pub fn with_script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_path = path.into();
        self
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "job_name cannot be empty".to_string(),
            ));
        }
        if self.cpus_per_task == 0 {
            return Err(ConfigError::ValidationFailed(
                "cpus_per_task must be greater than 0".to_string(),
            ));
        }
        if self.default_time_limit.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_time_limit must be greater than 0".to_string(),
            ));
        }
        if self.max_parallel_tasks == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_parallel_tasks must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One array task: a run and where it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTask {
    pub run_id: String,
    pub work_dir: PathBuf,
    pub argv: Vec<String>,
    pub time_limit: Duration,
}

/// A batch of runs serialized for submission as one job array.
#[derive(Debug, Clone)]
pub struct JobArray {
    pub name: String,
    pub script_path: PathBuf,
    pub script: String,
    pub tasks: Vec<JobTask>,
}

impl JobArray {
    /// Builds the array and renders its submission script.
    pub fn new(config: &ClusterConfig, jobs: &[RunJob]) -> Self {
        let tasks: Vec<JobTask> = jobs
            .iter()
            .map(|job| JobTask {
                run_id: job.run_id.clone(),
                work_dir: job.work_dir.clone(),
                argv: job.argv.clone(),
                time_limit: job.time_limit.unwrap_or(config.default_time_limit),
            })
            .collect();
        let script = render_script(config, &tasks);

        Self {
            name: config.job_name.clone(),
            script_path: config.script_path.clone(),
            script,
            tasks,
        }
    }
}

fn render_script(config: &ClusterConfig, tasks: &[JobTask]) -> String {
    let longest = tasks
        .iter()
        .map(|t| t.time_limit)
        .max()
        .unwrap_or(config.default_time_limit)
        + config.time_limit_margin;

    let mut script = String::from("#!/bin/bash\n");
    let _ = writeln!(script, "#SBATCH --job-name={}", config.job_name);
    if let Some(ref partition) = config.partition {
        let _ = writeln!(script, "#SBATCH --partition={}", partition);
    }
    let _ = writeln!(script, "#SBATCH --time={}", format_hms(longest));
    let _ = writeln!(script, "#SBATCH --ntasks=1");
    let _ = writeln!(script, "#SBATCH --cpus-per-task={}", config.cpus_per_task);
    if let Some(mb) = config.memory_per_cpu_mb {
        let _ = writeln!(script, "#SBATCH --mem-per-cpu={}M", mb);
    }
    let last = tasks.len().saturating_sub(1);
    match config.max_parallel_tasks {
        Some(max) => {
            let _ = writeln!(script, "#SBATCH --array=0-{}%{}", last, max);
        }
        None => {
            let _ = writeln!(script, "#SBATCH --array=0-{}", last);
        }
    }
    let _ = writeln!(script, "#SBATCH --output=/dev/null");
    let _ = writeln!(script, "#SBATCH --error=/dev/null");
    for directive in &config.extra_directives {
        let _ = writeln!(script, "{}", directive);
    }

    script.push_str("\ncase \"$SLURM_ARRAY_TASK_ID\" in\n");
    for (index, task) in tasks.iter().enumerate() {
        let command: Vec<String> = task.argv.iter().map(|a| shell_quote(a)).collect();
        let _ = writeln!(
            script,
            "  {}) cd {} && exec timeout {} {} > {} 2> {} ;;",
            index,
            shell_quote(&task.work_dir.to_string_lossy()),
            task.time_limit.as_secs().max(1),
            command.join(" "),
            RUN_LOG,
            RUN_ERR
        );
    }
    script.push_str("  *) echo \"unknown array task $SLURM_ARRAY_TASK_ID\" >&2; exit 1 ;;\nesac\n");
    script
}

fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Runs batches as a scheduler job array.
pub struct ClusterEnvironment<S: Scheduler> {
    config: ClusterConfig,
    scheduler: S,
}

impl<S: Scheduler> ClusterEnvironment<S> {
    /// Creates a cluster environment.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: ClusterConfig, scheduler: S) -> Result<Self, EnvironmentError> {
        config
            .validate()
            .map_err(|e| EnvironmentError::InvalidConfig(e.to_string()))?;
        Ok(Self { config, scheduler })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Polls until every task is terminal or polling keeps failing.
    async fn wait_for(&self, job_id: &str, task_count: usize) -> Vec<TaskState> {
        let mut states = vec![TaskState::Pending; task_count];
        let mut failures = 0u32;
        let mut last_error = String::new();

        loop {
            match self.scheduler.poll(job_id).await {
                Ok(polled) if polled.len() == task_count => {
                    failures = 0;
                    states = polled;
                    let done = states.iter().filter(|s| s.is_terminal()).count();
                    debug!("Job {}: {}/{} tasks terminal", job_id, done, task_count);
                    if done == task_count {
                        return states;
                    }
                }
                Ok(polled) => {
                    failures += 1;
                    last_error = format!(
                        "scheduler reported {} tasks, expected {}",
                        polled.len(),
                        task_count
                    );
                    warn!("Job {}: {}", job_id, last_error);
                }
                Err(e) => {
                    failures += 1;
                    last_error = e.to_string();
                    warn!("Job {}: poll failed ({}): {}", job_id, failures, e);
                }
            }

            if failures > self.config.max_poll_failures {
                error!(
                    "Job {}: giving up after {} consecutive poll failures",
                    job_id, failures
                );
                for state in states.iter_mut().filter(|s| !s.is_terminal()) {
                    *state = TaskState::Failed {
                        message: format!("lost track of task: {}", last_error),
                    };
                }
                return states;
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Exit code of the `timeout` wrapper in the array script when the limit expires.
const TIMEOUT_EXIT_CODE: i32 = 124;

fn outcome_for(task: &JobTask, state: TaskState, submitted_at: DateTime<Utc>) -> RunOutcome {
    match state {
        TaskState::Completed {
            exit_code: TIMEOUT_EXIT_CODE,
            elapsed,
        }
        | TaskState::TimedOut { elapsed } => {
            let mut outcome = RunOutcome::timeout(&task.run_id, submitted_at, task.time_limit);
            if let Some(elapsed) = elapsed {
                outcome.wall_clock_time = Some(elapsed.as_secs_f64());
            }
            outcome
        }
        TaskState::Completed { exit_code, elapsed } => {
            RunOutcome::exited(&task.run_id, exit_code, submitted_at, elapsed)
        }
        TaskState::Failed { message } => {
            RunOutcome::failed(&task.run_id, submitted_at, None, message)
        }
        TaskState::Pending | TaskState::Running => RunOutcome::failed(
            &task.run_id,
            submitted_at,
            None,
            "task never reached a terminal state",
        ),
    }
}

#[async_trait]
impl<S: Scheduler> Environment for ClusterEnvironment<S> {
    fn name(&self) -> &str {
        "cluster"
    }

    async fn execute(&self, jobs: &[RunJob]) -> Result<Vec<RunOutcome>, EnvironmentError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let array = JobArray::new(&self.config, jobs);
        if let Some(parent) = array.script_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&array.script_path, &array.script)?;
        for job in jobs {
            fs::create_dir_all(&job.work_dir)?;
        }
        info!(
            "Submitting job array '{}' with {} tasks ({})",
            array.name,
            array.tasks.len(),
            array.script_path.display()
        );

        let submitted_at = Utc::now();
        let outcomes: Vec<RunOutcome> = match self.scheduler.submit(&array).await {
            Err(e) => {
                error!("Submission of job array '{}' failed: {}", array.name, e);
                array
                    .tasks
                    .iter()
                    .map(|t| RunOutcome::submission_failed(&t.run_id, e.to_string()))
                    .collect()
            }
            Ok(job_id) => {
                info!("Job array '{}' submitted as {}", array.name, job_id);
                let states = self.wait_for(&job_id, array.tasks.len()).await;
                array
                    .tasks
                    .iter()
                    .zip(states)
                    .map(|(task, state)| outcome_for(task, state, submitted_at))
                    .collect()
            }
        };

        for (job, outcome) in jobs.iter().zip(&outcomes) {
            if let Err(e) = outcome.write_artifacts(job) {
                warn!("Failed to record outcome of run {}: {}", job.run_id, e);
            }
        }

        Ok(outcomes)
    }
}
