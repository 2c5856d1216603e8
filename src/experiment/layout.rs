//! On-disk layout of an experiment.
//!
//! ```text
//! <path>/
//!   runs.json            run ids in registration order
//!   steps.json           completed steps
//!   job-array.sh         cluster submission script (cluster only)
//!   runs/<id>/...        run directories, see `crate::environment`
//! <eval_dir>/
//!   properties.json      the attribute table
//!   runs/<id>/...        fetched copies of the run directories
//!   <report outfiles>
//! ```

use std::path::{Path, PathBuf};

pub const COMMAND_FILE: &str = "command.json";
pub const RUN_LOG: &str = "run.log";
pub const RUN_ERR: &str = "run.err";
pub const DRIVER_LOG: &str = "driver.log";
pub const OUTCOME_FILE: &str = "outcome.json";

const RUNS_DIR: &str = "runs";
const RUNS_INDEX: &str = "runs.json";
const STEPS_FILE: &str = "steps.json";
const PROPERTIES_FILE: &str = "properties.json";
const JOB_SCRIPT: &str = "job-array.sh";

/// Resolves every path an experiment reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    path: PathBuf,
    eval_dir: PathBuf,
}

impl ExperimentLayout {
    pub fn new(path: impl Into<PathBuf>, eval_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            eval_dir: eval_dir.into(),
        }
    }

    /// The evaluation directory used when none is configured: `<path>-eval`.
    pub fn default_eval_dir(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "exp".into());
        name.push("-eval");
        path.with_file_name(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn eval_dir(&self) -> &Path {
        &self.eval_dir
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.path.join(RUNS_DIR)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn eval_run_dir(&self, run_id: &str) -> PathBuf {
        self.eval_dir.join(RUNS_DIR).join(run_id)
    }

    pub fn runs_index(&self) -> PathBuf {
        self.path.join(RUNS_INDEX)
    }

    pub fn steps_file(&self) -> PathBuf {
        self.path.join(STEPS_FILE)
    }

    pub fn job_script(&self) -> PathBuf {
        self.path.join(JOB_SCRIPT)
    }

    pub fn properties_file(&self) -> PathBuf {
        self.eval_dir.join(PROPERTIES_FILE)
    }

    pub fn report_path(&self, outfile: &str) -> PathBuf {
        self.eval_dir.join(outfile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_eval_dir() {
        assert_eq!(
            ExperimentLayout::default_eval_dir(Path::new("/data/exp")),
            PathBuf::from("/data/exp-eval")
        );
    }

    #[test]
    fn test_paths() {
        let layout = ExperimentLayout::new("/data/exp", "/data/exp-eval");
        assert_eq!(layout.run_dir("a-1"), PathBuf::from("/data/exp/runs/a-1"));
        assert_eq!(
            layout.eval_run_dir("a-1"),
            PathBuf::from("/data/exp-eval/runs/a-1")
        );
        assert_eq!(
            layout.report_path("report.csv"),
            PathBuf::from("/data/exp-eval/report.csv")
        );
    }
}
