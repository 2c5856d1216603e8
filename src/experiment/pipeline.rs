//! The experiment: runs, environment, parsers, reports and the step sequence.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::config::ExperimentConfig;
use super::layout::{ExperimentLayout, COMMAND_FILE, OUTCOME_FILE};
use super::run::Run;
use super::steps::{
    CompletedSteps, Step, StepAction, BUILD_STEP, DEFAULT_FETCH_STEP, PARSE_AGAIN_STEP,
    REPORT_STEP, START_STEP,
};
use crate::environment::{Environment, RunJob, RunOutcome, RunStatus};
use crate::error::{EnvironmentError, ExperimentError};
use crate::parser::{Parser, PatternParser, RunArtifacts};
use crate::report::table::{AttributeRecord, AttributeTable, RecordError};
use crate::report::Report;

/// Attribute holding the terminal status of the run.
pub const RUN_STATUS_ATTRIBUTE: &str = "run_status";
/// Status recorded for runs whose outcome has not been fetched.
pub const NOT_FETCHED: &str = "not_fetched";

/// Result of a fetch step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Runs whose artifacts were copied to the evaluation directory.
    pub fetched: usize,
    /// Runs without an outcome marker yet.
    pub pending: usize,
    /// Runs whose artifacts could not be copied.
    pub failed: Vec<String>,
}

/// A batch of solver runs and the pipeline that executes and evaluates them.
pub struct Experiment {
    config: ExperimentConfig,
    layout: ExperimentLayout,
    environment: Box<dyn Environment>,
    runs: Vec<Run>,
    parsers: Vec<Box<dyn Parser>>,
    reports: Vec<(Box<dyn Report>, String)>,
    steps: Vec<Arc<Step>>,
    completed: CompletedSteps,
    frozen: bool,
    table: Option<AttributeTable>,
}

impl Experiment {
    /// Creates an experiment. Completed steps of earlier invocations are
    /// loaded from `<path>/steps.json`.
    pub fn new<E>(config: ExperimentConfig, environment: E) -> Result<Self, ExperimentError>
    where
        E: Environment + 'static,
    {
        config.validate()?;
        let layout = config.layout();
        let completed = CompletedSteps::load(&layout.steps_file());

        info!(
            "Experiment at {} (eval: {}, environment: {})",
            layout.path().display(),
            layout.eval_dir().display(),
            environment.name()
        );

        Ok(Self {
            config,
            layout,
            environment: Box::new(environment),
            runs: Vec::new(),
            parsers: Vec::new(),
            reports: Vec::new(),
            steps: Vec::new(),
            completed,
            frozen: false,
            table: None,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn layout(&self) -> &ExperimentLayout {
        &self.layout
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Registered step names, in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed.contains(step)
    }

    /// The attribute table produced (or loaded) during this invocation.
    pub fn table(&self) -> Option<&AttributeTable> {
        self.table.as_ref()
    }

    /// Registers a run.
    ///
    /// # Errors
    ///
    /// Fails if the experiment has started, the id is invalid or already taken.
    pub fn add_run(&mut self, run: Run) -> Result<(), ExperimentError> {
        if self.frozen {
            return Err(ExperimentError::RunsFrozen);
        }
        run.validate()?;
        if self.runs.iter().any(|r| r.id() == run.id()) {
            return Err(ExperimentError::DuplicateRun(run.id().to_string()));
        }
        self.runs.push(run);
        Ok(())
    }

    pub fn add_runs(&mut self, runs: impl IntoIterator<Item = Run>) -> Result<(), ExperimentError> {
        for run in runs {
            self.add_run(run)?;
        }
        Ok(())
    }

    /// Appends a parser; later parsers override attributes of earlier ones.
    pub fn add_parser<P: Parser + 'static>(&mut self, parser: P) {
        debug!("Registered parser '{}'", parser.name());
        self.parsers.push(Box::new(parser));
    }

    /// Loads a YAML pattern parser and appends it.
    pub fn add_parser_file(&mut self, path: &Path) -> Result<(), ExperimentError> {
        let parser = PatternParser::from_yaml_file(path)?;
        info!("Loaded parser '{}' from {}", parser.name(), path.display());
        self.add_parser(parser);
        Ok(())
    }

    /// Registers a report written to `<eval_dir>/<outfile>`. The first report
    /// also registers the report step.
    pub fn add_report<R: Report + 'static>(
        &mut self,
        report: R,
        outfile: impl Into<String>,
    ) -> Result<(), ExperimentError> {
        if !self
            .steps
            .iter()
            .any(|s| matches!(s.action, StepAction::Report))
        {
            self.add_step(REPORT_STEP, StepAction::Report)?;
        }
        self.reports.push((Box::new(report), outfile.into()));
        Ok(())
    }

    /// Registers a step. Steps execute in registration order.
    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        action: StepAction,
    ) -> Result<(), ExperimentError> {
        let name = name.into();
        if self.steps.iter().any(|s| s.name == name) {
            return Err(ExperimentError::DuplicateStep(name));
        }
        self.steps.push(Arc::new(Step::new(name, action)));
        Ok(())
    }

    pub fn add_build_step(&mut self) -> Result<(), ExperimentError> {
        self.add_step(BUILD_STEP, StepAction::Build)
    }

    pub fn add_start_step(&mut self) -> Result<(), ExperimentError> {
        self.add_step(START_STEP, StepAction::Start)
    }

    /// Registers a fetch step; `None` uses the default name `fetch`.
    pub fn add_fetcher(&mut self, name: Option<&str>) -> Result<(), ExperimentError> {
        self.add_step(name.unwrap_or(DEFAULT_FETCH_STEP), StepAction::Fetch)
    }

    pub fn add_parse_again_step(&mut self) -> Result<(), ExperimentError> {
        self.add_step(PARSE_AGAIN_STEP, StepAction::ParseAgain)
    }

    pub fn add_custom_step<F>(&mut self, name: impl Into<String>, action: F) -> Result<(), ExperimentError>
    where
        F: Fn(&mut Experiment) -> Result<(), ExperimentError> + Send + Sync + 'static,
    {
        self.add_step(name, StepAction::Custom(Box::new(action)))
    }

    /// Runs the selected steps in registration order.
    ///
    /// Selectors are step names, 1-based indices or `all`; an empty selection
    /// runs every step. Unknown selectors are rejected before any step runs.
    /// The first failing step halts the invocation.
    pub async fn run_steps(&mut self, selectors: &[String]) -> Result<(), ExperimentError> {
        let selected = self.resolve_selection(selectors)?;
        // Steps registered by custom actions join the list but not this invocation.
        let steps = self.steps.clone();
        self.run_selected(&steps, &selected).await
    }

    fn resolve_selection(&self, selectors: &[String]) -> Result<Vec<usize>, ExperimentError> {
        if selectors.is_empty() || selectors.iter().any(|s| s == "all") {
            return Ok((0..self.steps.len()).collect());
        }

        let mut selected = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let index = match selector.parse::<usize>() {
                Ok(n) if n >= 1 && n <= self.steps.len() => Some(n - 1),
                Ok(_) => None,
                Err(_) => self.steps.iter().position(|s| &s.name == selector),
            };
            match index {
                Some(i) => selected.push(i),
                None => return Err(ExperimentError::UnknownStep(selector.clone())),
            }
        }
        selected.sort_unstable();
        selected.dedup();
        Ok(selected)
    }

    async fn run_selected(
        &mut self,
        steps: &[Arc<Step>],
        selected: &[usize],
    ) -> Result<(), ExperimentError> {
        for &index in selected {
            let step = &steps[index];
            self.check_order(step, steps)?;

            info!("Running step {}/{}: {}", index + 1, steps.len(), step.name);
            let start = Instant::now();

            let result = match &step.action {
                StepAction::Build => self.build(),
                StepAction::Start => self.start_runs().await.map(|_| ()),
                StepAction::Fetch => self.fetch().map(|_| ()),
                StepAction::ParseAgain => self.parse_again().map(|_| ()),
                StepAction::Report => self.write_reports(),
                StepAction::Custom(action) => action(self),
            };

            if let Err(e) = result {
                warn!("Step '{}' failed: {}", step.name, e);
                return Err(in_step(&step.name, e));
            }

            self.completed.mark(&step.name)?;
            info!(
                "Step '{}' completed in {:.2}s",
                step.name,
                start.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Refuses a step whose input stage is registered but never completed.
    fn check_order(&self, step: &Step, steps: &[Arc<Step>]) -> Result<(), ExperimentError> {
        let Some(required) = step.kind().prerequisite() else {
            return Ok(());
        };
        let providers: Vec<&Arc<Step>> = steps.iter().filter(|s| s.kind() == required).collect();
        let Some(first) = providers.first() else {
            return Ok(());
        };
        if providers.iter().any(|s| self.completed.contains(&s.name)) {
            Ok(())
        } else {
            Err(ExperimentError::StepOrder {
                step: step.name.clone(),
                missing: first.name.clone(),
            })
        }
    }

    /// Recreates every run directory and writes its `command.json`.
    pub fn build(&mut self) -> Result<(), ExperimentError> {
        fs::create_dir_all(self.layout.runs_dir())?;

        for run in &self.runs {
            let dir = self.layout.run_dir(run.id());
            let failed = |e: io::Error| ExperimentError::RunStage {
                step: BUILD_STEP.to_string(),
                run_id: run.id().to_string(),
                message: e.to_string(),
            };

            if dir.exists() {
                if !dir.is_dir() {
                    return Err(failed(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a directory", dir.display()),
                    )));
                }
                fs::remove_dir_all(&dir).map_err(failed)?;
            }
            fs::create_dir_all(&dir).map_err(failed)?;
            let descriptor = serde_json::to_string_pretty(run)?;
            fs::write(dir.join(COMMAND_FILE), descriptor).map_err(failed)?;
        }

        let ids: Vec<&str> = self.runs.iter().map(|r| r.id()).collect();
        fs::write(self.layout.runs_index(), serde_json::to_string_pretty(&ids)?)?;

        info!(
            "Built {} run directories in {}",
            self.runs.len(),
            self.layout.runs_dir().display()
        );
        Ok(())
    }

    /// Freezes the run list and executes every run exactly once.
    pub async fn start_runs(&mut self) -> Result<Vec<RunOutcome>, ExperimentError> {
        self.frozen = true;

        let jobs: Vec<RunJob> = self
            .runs
            .iter()
            .map(|run| {
                let mut job = run.to_job(self.layout.run_dir(run.id()));
                if job.time_limit.is_none() {
                    job.time_limit = Some(self.config.time_limit());
                }
                job
            })
            .collect();

        info!(
            "Starting {} runs on the {} environment",
            jobs.len(),
            self.environment.name()
        );

        let outcomes = self.environment.execute(&jobs).await?;
        if outcomes.len() != jobs.len() {
            return Err(EnvironmentError::OutcomeCount {
                expected: jobs.len(),
                actual: outcomes.len(),
            }
            .into());
        }

        let count = |status: RunStatus| outcomes.iter().filter(|o| o.status == status).count();
        info!(
            "Runs finished: {} success, {} failed, {} timeout, {} not submitted",
            count(RunStatus::Success),
            count(RunStatus::Failed),
            count(RunStatus::Timeout),
            count(RunStatus::SubmissionFailed)
        );
        Ok(outcomes)
    }

    /// Copies the artifacts of every finished run into the evaluation directory.
    pub fn fetch(&mut self) -> Result<FetchSummary, ExperimentError> {
        let mut summary = FetchSummary::default();

        for run in &self.runs {
            let source = self.layout.run_dir(run.id());
            if !source.join(OUTCOME_FILE).is_file() {
                debug!("Run {} has no outcome yet, skipping", run.id());
                summary.pending += 1;
                continue;
            }

            let dest = self.layout.eval_run_dir(run.id());
            match copy_run_dir(&source, &dest) {
                Ok(()) => summary.fetched += 1,
                Err(e) => {
                    warn!("Failed to fetch run {}: {}", run.id(), e);
                    summary.failed.push(run.id().to_string());
                }
            }
        }

        if summary.pending > 0 {
            warn!("{} runs are not fetchable yet", summary.pending);
        }
        info!(
            "Fetched {} runs into {}",
            summary.fetched,
            self.layout.eval_dir().display()
        );
        Ok(summary)
    }

    /// Builds the attribute table from the fetched artifacts and saves it.
    ///
    /// Never executes runs. Re-running on unchanged artifacts yields an
    /// identical table.
    pub fn parse_again(&mut self) -> Result<&AttributeTable, ExperimentError> {
        let mut table = AttributeTable::new();

        for run in &self.runs {
            let dir = self.layout.eval_run_dir(run.id());
            let mut record = AttributeRecord::new(run.id());
            for (key, value) in run.properties() {
                record.set(key.clone(), value.clone());
            }
            record_outcome(&mut record, RunOutcome::load(&dir));

            let artifacts = RunArtifacts::new(run.id(), dir);
            for parser in &self.parsers {
                record.merge(parser.apply(&artifacts));
            }
            table.push(record);
        }

        table.save(&self.layout.properties_file())?;
        info!(
            "Parsed {} runs with {} parsers ({} with errors)",
            table.len(),
            self.parsers.len(),
            table.error_count()
        );
        Ok(&*self.table.insert(table))
    }

    /// Renders every registered report into the evaluation directory.
    pub fn write_reports(&mut self) -> Result<(), ExperimentError> {
        if self.table.is_none() {
            let path = self.layout.properties_file();
            if path.is_file() {
                self.table = Some(AttributeTable::load(&path)?);
            }
        }
        let Some(table) = self.table.as_ref() else {
            return Err(ExperimentError::StepOrder {
                step: REPORT_STEP.to_string(),
                missing: PARSE_AGAIN_STEP.to_string(),
            });
        };

        if self.reports.is_empty() {
            warn!("No reports registered");
        }

        for (report, outfile) in &self.reports {
            let bytes = report.render(table)?;
            let path = self.layout.report_path(outfile);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, bytes)?;
            info!("Wrote {} report to {}", report.name(), path.display());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("path", &self.layout.path())
            .field("environment", &self.environment.name())
            .field("runs", &self.runs.len())
            .field("parsers", &self.parsers.len())
            .field("reports", &self.reports.len())
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Adds the outcome attributes; a run that did not succeed gets a record error.
fn record_outcome(record: &mut AttributeRecord, outcome: Option<RunOutcome>) {
    let Some(outcome) = outcome else {
        record.set(RUN_STATUS_ATTRIBUTE, NOT_FETCHED);
        record.errors.push(RecordError {
            attribute: RUN_STATUS_ATTRIBUTE.to_string(),
            message: "run outcome has not been fetched".to_string(),
        });
        return;
    };

    record.set(RUN_STATUS_ATTRIBUTE, outcome.status.to_string());
    record.set("exit_code", outcome.exit_code.map(i64::from));
    record.set("wall_clock_time", outcome.wall_clock_time);

    if !outcome.is_success() {
        let message = outcome
            .message
            .unwrap_or_else(|| format!("run finished with status {}", outcome.status));
        record.errors.push(RecordError {
            attribute: RUN_STATUS_ATTRIBUTE.to_string(),
            message,
        });
    }
}

/// Replaces `dest` with a copy of `source`. The outcome marker is copied
/// last so its presence implies a complete copy.
fn copy_run_dir(source: &Path, dest: &Path) -> io::Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let mut marker = None;
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if relative == Path::new(OUTCOME_FILE) {
            marker = Some((entry.path().to_path_buf(), target));
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    if let Some((from, to)) = marker {
        fs::copy(from, to)?;
    }
    Ok(())
}

/// Attaches the step name to errors that do not carry one.
fn in_step(step: &str, err: ExperimentError) -> ExperimentError {
    match err {
        ExperimentError::Io(_)
        | ExperimentError::Json(_)
        | ExperimentError::Environment(_)
        | ExperimentError::Report(_)
        | ExperimentError::Parser(_) => ExperimentError::Stage {
            step: step.to_string(),
            message: err.to_string(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{
        ClusterConfig, ClusterEnvironment, JobArray, LocalEnvironment, RunStatus, Scheduler,
        TaskState,
    };
    use crate::error::SchedulerError;
    use crate::experiment::layout::RUN_LOG;
    use crate::parser::{AttributeValue, ExtractionPattern, ValueType};
    use crate::report::CsvReport;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes a canned stdout for every job without spawning anything.
    struct FakeEnvironment {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Environment for FakeEnvironment {
        fn name(&self) -> &str {
            "fake"
        }

        async fn execute(&self, jobs: &[RunJob]) -> Result<Vec<RunOutcome>, EnvironmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = Vec::new();
            for job in jobs {
                fs::create_dir_all(&job.work_dir)?;
                fs::write(job.work_dir.join(RUN_LOG), format!("c {}\ns OPTIMAL\n", job.run_id))?;
                let code = if job.run_id.starts_with("bad") { 1 } else { 0 };
                let outcome = RunOutcome::exited(
                    &job.run_id,
                    code,
                    Utc::now(),
                    Some(Duration::from_millis(250)),
                );
                outcome.write_artifacts(job)?;
                outcomes.push(outcome);
            }
            Ok(outcomes)
        }
    }

    struct RejectingScheduler;

    #[async_trait]
    impl Scheduler for RejectingScheduler {
        async fn submit(&self, _job: &JobArray) -> Result<String, SchedulerError> {
            Err(SchedulerError::Rejected("queue closed".into()))
        }

        async fn poll(&self, _job_id: &str) -> Result<Vec<TaskState>, SchedulerError> {
            Ok(Vec::new())
        }
    }

    fn experiment(temp: &TempDir) -> (Experiment, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ExperimentConfig::new(temp.path().join("exp"));
        let env = FakeEnvironment {
            calls: Arc::clone(&calls),
        };
        (Experiment::new(config, env).unwrap(), calls)
    }

    fn full_pipeline(exp: &mut Experiment) {
        exp.add_build_step().unwrap();
        exp.add_start_step().unwrap();
        exp.add_fetcher(None).unwrap();
        exp.add_parse_again_step().unwrap();
        exp.add_parser(
            PatternParser::new("status")
                .with_pattern(ExtractionPattern::new("status", r"s ([A-Z]+)$").unwrap())
                .unwrap(),
        );
        exp.add_report(CsvReport::new(["id", "status", "run_status"]), "report.csv")
            .unwrap();
    }

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Build, start, fetch and parse with a required driver-log timing pattern.
    fn timed_pipeline(exp: &mut Experiment) {
        exp.add_build_step().unwrap();
        exp.add_start_step().unwrap();
        exp.add_fetcher(None).unwrap();
        exp.add_parse_again_step().unwrap();
        exp.add_parser(
            PatternParser::new("timing")
                .with_pattern(
                    ExtractionPattern::new("solve_time", r"solve wall-clock time: ([0-9\.]+)s$")
                        .unwrap()
                        .with_type(ValueType::Float)
                        .with_file("driver.log")
                        .required(true),
                )
                .unwrap(),
        );
    }

    /// A run that never executed has no timing, only errors.
    fn assert_never_ran(record: &AttributeRecord, status: &str) {
        assert_eq!(record.get("run_status"), &AttributeValue::Str(status.into()));
        assert!(record.get("solve_time").is_error(), "{:?}", record.get("solve_time"));
        assert!(record.get("wall_clock_time").is_absent());
        let attributes: Vec<_> = record.errors.iter().map(|e| e.attribute.as_str()).collect();
        assert!(attributes.contains(&"solve_time"));
        assert!(attributes.contains(&"run_status"));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_build_step().unwrap();
        assert!(matches!(
            exp.add_build_step(),
            Err(ExperimentError::DuplicateStep(name)) if name == "build"
        ));
    }

    #[test]
    fn test_add_run_validation() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_run(Run::new("a", ["true"])).unwrap();
        assert!(matches!(
            exp.add_run(Run::new("a", ["true"])),
            Err(ExperimentError::DuplicateRun(_))
        ));
        assert!(matches!(
            exp.add_run(Run::new("x/y", ["true"])),
            Err(ExperimentError::InvalidRunId { .. })
        ));
        assert_eq!(exp.runs().len(), 1);
    }

    #[test]
    fn test_report_step_registered_once() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_report(CsvReport::new(["id"]), "a.csv").unwrap();
        exp.add_report(CsvReport::new(["id"]), "b.csv").unwrap();
        assert_eq!(exp.step_names(), vec!["report"]);
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let temp = TempDir::new().unwrap();
        let (mut exp, calls) = experiment(&temp);
        exp.add_runs([
            Run::new("good-1", ["solver"]),
            Run::new("bad-1", ["solver"]),
        ])
        .unwrap();
        full_pipeline(&mut exp);

        exp.run_steps(&[]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let table = exp.table().unwrap();
        assert_eq!(table.len(), 2);
        let good = table.get("good-1").unwrap();
        assert_eq!(good.get("status"), &AttributeValue::Str("OPTIMAL".into()));
        assert_eq!(good.get("run_status"), &AttributeValue::Str("success".into()));
        assert!(!good.has_errors());

        let bad = table.get("bad-1").unwrap();
        assert_eq!(bad.get("run_status"), &AttributeValue::Str("failed".into()));
        assert_eq!(bad.get("exit_code"), &AttributeValue::Int(1));
        assert!(bad.has_errors());

        let csv = fs::read_to_string(exp.layout().report_path("report.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec!["id,status,run_status", "good-1,OPTIMAL,success", "bad-1,OPTIMAL,failed"]
        );
        for step in ["build", "start", "fetch", "parse-again", "report"] {
            assert!(exp.is_completed(step), "{} not completed", step);
        }
    }

    #[tokio::test]
    async fn test_unknown_step_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let (mut exp, calls) = experiment(&temp);
        exp.add_run(Run::new("r", ["solver"])).unwrap();
        full_pipeline(&mut exp);

        let err = exp.run_steps(&steps(&["build", "bogus"])).await.unwrap_err();
        assert!(matches!(err, ExperimentError::UnknownStep(ref s) if s == "bogus"));
        let err = exp.run_steps(&steps(&["9"])).await.unwrap_err();
        assert!(matches!(err, ExperimentError::UnknownStep(_)));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!exp.layout().run_dir("r").exists());
    }

    #[tokio::test]
    async fn test_step_order_enforced() {
        let temp = TempDir::new().unwrap();
        let (mut exp, calls) = experiment(&temp);
        exp.add_run(Run::new("r", ["solver"])).unwrap();
        full_pipeline(&mut exp);

        let err = exp.run_steps(&steps(&["start"])).await.unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::StepOrder { ref step, ref missing } if step == "start" && missing == "build"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Selecting by 1-based index.
        exp.run_steps(&steps(&["1", "2"])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runs_frozen_after_start() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_run(Run::new("r", ["solver"])).unwrap();
        exp.add_build_step().unwrap();
        exp.add_start_step().unwrap();

        exp.run_steps(&[]).await.unwrap();
        assert!(matches!(
            exp.add_run(Run::new("late", ["solver"])),
            Err(ExperimentError::RunsFrozen)
        ));
    }

    #[tokio::test]
    async fn test_failing_custom_step_halts() {
        let temp = TempDir::new().unwrap();
        let (mut exp, calls) = experiment(&temp);
        exp.add_run(Run::new("r", ["solver"])).unwrap();
        exp.add_build_step().unwrap();
        exp.add_custom_step("check", |_| {
            Err(ExperimentError::Stage {
                step: "check".into(),
                message: "disk full".into(),
            })
        })
        .unwrap();
        exp.add_start_step().unwrap();

        let err = exp.run_steps(&[]).await.unwrap_err();
        assert!(matches!(err, ExperimentError::Stage { ref step, .. } if step == "check"));
        assert!(exp.is_completed("build"));
        assert!(!exp.is_completed("check"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(exp.step_names(), vec!["build", "check", "start"]);
    }

    #[tokio::test]
    async fn test_cluster_submission_failure_recorded() {
        let temp = TempDir::new().unwrap();
        let config = ExperimentConfig::new(temp.path().join("exp"));
        let cluster = ClusterConfig::new("bench").with_script_path(config.layout().job_script());
        let env = ClusterEnvironment::new(cluster, RejectingScheduler).unwrap();

        let mut exp = Experiment::new(config, env).unwrap();
        exp.add_runs([Run::new("a", ["solver"]), Run::new("b", ["solver"])])
            .unwrap();
        timed_pipeline(&mut exp);

        exp.run_steps(&[]).await.unwrap();
        assert!(exp.layout().job_script().is_file());

        let table = exp.table().unwrap();
        assert_eq!(table.len(), 2);
        for record in table.records() {
            assert_never_ran(record, "submission_failed");
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_recorded() {
        let temp = TempDir::new().unwrap();
        let config = ExperimentConfig::new(temp.path().join("exp"));
        let mut exp = Experiment::new(config, LocalEnvironment::new(1).unwrap()).unwrap();
        exp.add_run(Run::new("missing", ["/nonexistent/solver-binary"]))
            .unwrap();
        timed_pipeline(&mut exp);

        exp.run_steps(&[]).await.unwrap();

        let record = exp.table().unwrap().get("missing").unwrap();
        assert_never_ran(record, "failed");
        assert!(record.get("exit_code").is_absent());
    }

    #[test]
    fn test_build_failure_names_run() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_runs([Run::new("a", ["solver"]), Run::new("b", ["solver"])])
            .unwrap();
        fs::create_dir_all(exp.layout().runs_dir()).unwrap();
        fs::write(exp.layout().run_dir("b"), "in the way").unwrap();

        let err = exp.build().unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::RunStage { ref step, ref run_id, .. } if step == "build" && run_id == "b"
        ));
    }

    #[tokio::test]
    async fn test_build_failure_halts_pipeline() {
        let temp = TempDir::new().unwrap();
        let (mut exp, calls) = experiment(&temp);
        exp.add_run(Run::new("a", ["solver"])).unwrap();
        full_pipeline(&mut exp);
        fs::create_dir_all(exp.layout().runs_dir()).unwrap();
        fs::write(exp.layout().run_dir("a"), "in the way").unwrap();

        let err = exp.run_steps(&[]).await.unwrap_err();
        assert!(matches!(err, ExperimentError::RunStage { ref run_id, .. } if run_id == "a"));
        assert!(!exp.is_completed("build"));
        assert!(!exp.is_completed("start"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(exp.table().is_none());
    }

    #[tokio::test]
    async fn test_steps_added_while_running_are_checked() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_report(CsvReport::new(["id"]), "report.csv").unwrap();
        exp.add_custom_step("extend", |exp| {
            exp.add_custom_step("later", |_| Ok(()))?;
            exp.add_custom_step("report", |_| Ok(()))
        })
        .unwrap();

        let err = exp.run_steps(&steps(&["extend"])).await.unwrap_err();
        assert!(matches!(err, ExperimentError::DuplicateStep(ref name) if name == "report"));
        assert_eq!(exp.step_names(), vec!["report", "extend", "later"]);
        assert!(!exp.is_completed("later"));
    }

    #[test]
    fn test_build_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_run(Run::new("r", ["solver", "in.fzn"]).with_property("phase", 1i64))
            .unwrap();

        exp.build().unwrap();
        let command = exp.layout().run_dir("r").join(COMMAND_FILE);
        let first = fs::read_to_string(&command).unwrap();
        fs::write(exp.layout().run_dir("r").join("stale.txt"), "x").unwrap();

        exp.build().unwrap();
        assert_eq!(fs::read_to_string(&command).unwrap(), first);
        assert!(!exp.layout().run_dir("r").join("stale.txt").exists());

        let descriptor: Run = serde_json::from_str(&first).unwrap();
        assert_eq!(&descriptor, &exp.runs()[0]);
    }

    #[test]
    fn test_unfetched_run_still_has_record() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_run(Run::new("r", ["solver"]).with_property("benchmark", "r"))
            .unwrap();

        let summary = exp.fetch().unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.fetched, 0);

        let table = exp.parse_again().unwrap();
        let record = table.get("r").unwrap();
        assert_eq!(record.get("run_status"), &AttributeValue::Str("not_fetched".into()));
        assert_eq!(record.get("benchmark"), &AttributeValue::Str("r".into()));
        assert!(record.has_errors());
    }

    #[test]
    fn test_report_without_table_is_order_error() {
        let temp = TempDir::new().unwrap();
        let (mut exp, _) = experiment(&temp);
        exp.add_report(CsvReport::new(["id"]), "report.csv").unwrap();
        assert!(matches!(
            exp.write_reports(),
            Err(ExperimentError::StepOrder { .. })
        ));
    }

    #[test]
    fn test_record_outcome_timeout() {
        let mut record = AttributeRecord::new("r");
        let outcome = RunOutcome::timeout("r", Utc::now(), Duration::from_secs(5));
        record_outcome(&mut record, Some(outcome));
        assert_eq!(record.get("run_status"), &AttributeValue::Str("timeout".into()));
        assert!(record.get("exit_code").is_absent());
        assert_eq!(record.get("wall_clock_time"), &AttributeValue::Float(5.0));
        assert_eq!(record.errors[0].message, "timed out after 5s");
        assert_eq!(RunStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_record_outcome_without_timing() {
        let mut record = AttributeRecord::new("r");
        record_outcome(&mut record, Some(RunOutcome::submission_failed("r", "queue closed")));
        assert_eq!(
            record.get("run_status"),
            &AttributeValue::Str("submission_failed".into())
        );
        assert!(record.get("wall_clock_time").is_absent());
        assert_eq!(record.errors[0].message, "queue closed");
    }
}
