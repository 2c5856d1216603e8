//! Experiment pipeline.
//!
//! An [`Experiment`] owns a list of runs, one execution environment, ordered
//! parsers and reports, and a sequence of named steps:
//!
//! 1. **build**: recreate one directory per run and write its command descriptor
//! 2. **start**: hand every run to the environment and wait until all are terminal
//! 3. **fetch**: copy finished runs into the evaluation directory
//! 4. **parse-again**: apply the parsers to the fetched artifacts
//! 5. **report**: render the attribute table
//!
//! Steps can be invoked selectively across process invocations; completion is
//! persisted so a later `report` can follow an earlier `parse-again`.
//!
//! # Example
//!
//! ```ignore
//! use solver_lab::environment::LocalEnvironment;
//! use solver_lab::experiment::{Experiment, ExperimentConfig, Run};
//! use solver_lab::report::CsvReport;
//!
//! let config = ExperimentConfig::new("./data/queens").with_processes(8);
//! let mut exp = Experiment::new(config, LocalEnvironment::new(8)?)?;
//! exp.add_run(Run::solver("queens-8", "pumpkin", "queens-8.fzn".as_ref(), limit))?;
//! exp.add_build_step()?;
//! exp.add_start_step()?;
//! exp.add_fetcher(None)?;
//! exp.add_parse_again_step()?;
//! exp.add_report(CsvReport::new(["id", "solve_time", "status"]), "report.csv")?;
//! exp.run_steps(&[]).await?;
//! ```

pub mod config;
pub mod layout;
pub mod pipeline;
pub mod run;
pub mod steps;

pub use config::ExperimentConfig;
pub use layout::ExperimentLayout;
pub use pipeline::{Experiment, FetchSummary, NOT_FETCHED, RUN_STATUS_ATTRIBUTE};
pub use run::{Run, DEFAULT_RUN_NAME};
pub use steps::{
    CompletedSteps, CustomAction, Step, StepAction, StepKind, BUILD_STEP, DEFAULT_FETCH_STEP,
    PARSE_AGAIN_STEP, REPORT_STEP, START_STEP,
};
