//! Error types for solver-lab operations.
//!
//! Defines error types for the major subsystems:
//! - Experiment configuration
//! - Pipeline steps (build, start, fetch, parse, report)
//! - Execution environments
//! - Log parsers
//! - Report rendering
//!
//! Per-run failures (non-zero exit, timeout, missing attribute) are not errors
//! here: they are recorded as values in the attribute table.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that halt a pipeline invocation.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Step '{step}' requires step '{missing}' to have completed first")]
    StepOrder { step: String, missing: String },

    #[error("Run '{0}' is already registered")]
    DuplicateRun(String),

    #[error("Invalid run id '{id}': {reason}")]
    InvalidRunId { id: String, reason: String },

    #[error("Runs cannot be added after the experiment has started")]
    RunsFrozen,

    #[error("Step '{step}' failed for run '{run_id}': {message}")]
    RunStage {
        step: String,
        run_id: String,
        message: String,
    },

    #[error("Step '{step}' failed: {message}")]
    Stage { step: String, message: String },

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by an execution environment as a whole.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Invalid environment configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to prepare submission: {0}")]
    Submission(String),

    #[error("Environment returned {actual} outcomes for {expected} runs")]
    OutcomeCount { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a cluster scheduler adapter.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Polling failed: {0}")]
    Poll(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while declaring or loading parsers.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("Invalid regex '{pattern}' for attribute '{attribute}': {message}")]
    InvalidRegex {
        attribute: String,
        pattern: String,
        message: String,
    },

    #[error("Attribute '{0}' is already declared by this parser")]
    DuplicateAttribute(String),

    #[error("Unknown value type '{0}'")]
    UnknownValueType(String),

    #[error("Failed to read parser file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while rendering a report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report has no columns")]
    NoColumns,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
