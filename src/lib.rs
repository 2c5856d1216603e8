//! solver-lab: benchmark experiments for constraint and SAT solvers.
//!
//! An experiment runs a solver over a set of instances, collects each run's
//! logs, extracts typed attributes with declarative regex patterns and renders
//! reports from the resulting attribute table.

pub mod cli;
pub mod environment;
pub mod error;
pub mod experiment;
pub mod parser;
pub mod report;

// Re-export commonly used types
pub use error::{
    ConfigError, EnvironmentError, ExperimentError, ParserError, ReportError, SchedulerError,
};
pub use experiment::{Experiment, ExperimentConfig, Run};
