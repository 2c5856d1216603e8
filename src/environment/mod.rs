//! Execution environments for experiment runs.
//!
//! An environment takes the full batch of runs and returns only once every
//! run has reached a terminal state. Two strategies are provided:
//!
//! - **LocalEnvironment**: a bounded pool of child processes on this machine
//! - **ClusterEnvironment**: a job array handed to a cluster scheduler through
//!   a [`Scheduler`] adapter
//!
//! # Run Directory
//!
//! ```text
//! runs/<id>/
//!   command.json   written by the build step
//!   run.log        solver stdout
//!   run.err        solver stderr
//!   driver.log     exit code and wall-clock time, one fact per line
//!   outcome.json   terminal status marker
//! ```
//!
//! Individual run failures never surface as `Err`: they are reported in the
//! returned [`RunOutcome`]s.

pub mod cluster;
pub mod local;
pub mod outcome;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EnvironmentError;

pub use cluster::{ClusterConfig, ClusterEnvironment, JobArray, JobTask, Scheduler, TaskState};
pub use local::LocalEnvironment;
pub use outcome::{RunOutcome, RunStatus};

/// Everything an environment needs to execute one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub run_id: String,
    /// Command name used as prefix in driver log lines.
    pub name: String,
    pub argv: Vec<String>,
    pub time_limit: Option<Duration>,
    pub work_dir: PathBuf,
}

/// Uniform "submit and wait" contract over execution strategies.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Executes every job and returns one outcome per job, in job order.
    ///
    /// # Errors
    ///
    /// Only for failures of the environment itself (e.g. a submission
    /// script that cannot be written), never for a single run.
    async fn execute(&self, jobs: &[RunJob]) -> Result<Vec<RunOutcome>, EnvironmentError>;
}
