//! Runs: one solver invocation plus its declared properties.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::RunJob;
use crate::error::ExperimentError;
use crate::parser::AttributeValue;

/// Default command name, used as prefix of driver log lines.
pub const DEFAULT_RUN_NAME: &str = "solve";

/// A single unit of work. Serialized as the run's `command.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    id: String,
    name: String,
    argv: Vec<String>,
    time_limit: Option<Duration>,
    properties: BTreeMap<String, AttributeValue>,
}

impl Run {
    /// Creates a run; its properties start with `id`.
    pub fn new<I, S>(id: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let mut properties = BTreeMap::new();
        properties.insert("id".to_string(), AttributeValue::Str(id.clone()));
        Self {
            id,
            name: DEFAULT_RUN_NAME.to_string(),
            argv: argv.into_iter().map(Into::into).collect(),
            time_limit: None,
            properties,
        }
    }

    /// Creates a run invoking `solver <input> -t <seconds>`.
    pub fn solver(
        id: impl Into<String>,
        solver: impl Into<String>,
        input: &Path,
        time_limit: Duration,
    ) -> Self {
        let argv = vec![
            solver.into(),
            input.to_string_lossy().into_owned(),
            "-t".to_string(),
            time_limit.as_secs().to_string(),
        ];
        Self::new(id, argv).with_time_limit(time_limit)
    }

    /// Sets the command name used in driver log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the wall-clock limit enforced by the environment.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Appends an argument to the command.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Adds a declared property. `id` cannot be overridden.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        let key = key.into();
        if key != "id" {
            self.properties.insert(key, value.into());
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    pub fn properties(&self) -> &BTreeMap<String, AttributeValue> {
        &self.properties
    }

    /// Checks the id is usable as a single directory name and the command is not empty.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        let invalid = |reason: &str| ExperimentError::InvalidRunId {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.is_empty() {
            return Err(invalid("id cannot be empty"));
        }
        if self.id == "." || self.id == ".." {
            return Err(invalid("id cannot be a relative directory"));
        }
        if self.id.contains(['/', '\\']) || self.id.chars().any(char::is_control) {
            return Err(invalid("id must be a single path component"));
        }
        if self.argv.is_empty() {
            return Err(invalid("command cannot be empty"));
        }
        Ok(())
    }

    /// Converts the run into a job executing in `work_dir`.
    pub fn to_job(&self, work_dir: PathBuf) -> RunJob {
        RunJob {
            run_id: self.id.clone(),
            name: self.name.clone(),
            argv: self.argv.clone(),
            time_limit: self.time_limit,
            work_dir,
        }
    }
}
