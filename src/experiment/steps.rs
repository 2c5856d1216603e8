//! Named pipeline steps and their persisted completion state.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Experiment;
use crate::error::ExperimentError;

pub const BUILD_STEP: &str = "build";
pub const START_STEP: &str = "start";
pub const DEFAULT_FETCH_STEP: &str = "fetch";
pub const PARSE_AGAIN_STEP: &str = "parse-again";
pub const REPORT_STEP: &str = "report";

/// A caller-provided step body.
pub type CustomAction = Box<dyn Fn(&mut Experiment) -> Result<(), ExperimentError> + Send + Sync>;

/// Kind of a built-in stage, used to resolve ordering dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Build,
    Start,
    Fetch,
    ParseAgain,
    Report,
    Custom,
}

impl StepKind {
    /// The stage whose artifacts this one consumes.
    pub fn prerequisite(&self) -> Option<StepKind> {
        match self {
            StepKind::Start | StepKind::Fetch => Some(StepKind::Build),
            StepKind::ParseAgain => Some(StepKind::Fetch),
            StepKind::Report => Some(StepKind::ParseAgain),
            StepKind::Build | StepKind::Custom => None,
        }
    }
}

/// What a step does when it runs.
pub enum StepAction {
    Build,
    Start,
    Fetch,
    ParseAgain,
    Report,
    Custom(CustomAction),
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::Build => StepKind::Build,
            StepAction::Start => StepKind::Start,
            StepAction::Fetch => StepKind::Fetch,
            StepAction::ParseAgain => StepKind::ParseAgain,
            StepAction::Report => StepKind::Report,
            StepAction::Custom(_) => StepKind::Custom,
        }
    }
}

impl std::fmt::Debug for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Custom(_) => write!(f, "Custom(..)"),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// A registered, named stage.
#[derive(Debug)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

/// Names of the steps that completed at least once, stored in `steps.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CompletedSteps {
    #[serde(skip)]
    path: PathBuf,
    completed: BTreeSet<String>,
}

impl CompletedSteps {
    /// Loads the completion state; a missing or unreadable file means nothing
    /// ran yet. An unreadable or corrupt file is logged.
    pub fn load(path: &Path) -> Self {
        let completed = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<CompletedSteps>(&content) {
                Ok(steps) => steps.completed,
                Err(e) => {
                    warn!("Ignoring corrupt step record {}: {}", path.display(), e);
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                BTreeSet::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            completed,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.completed.contains(name)
    }

    /// Marks a step as completed and persists the state.
    pub fn mark(&mut self, name: &str) -> Result<(), ExperimentError> {
        self.completed.insert(name.to_string());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prerequisites() {
        assert_eq!(StepKind::Build.prerequisite(), None);
        assert_eq!(StepKind::Start.prerequisite(), Some(StepKind::Build));
        assert_eq!(StepKind::Fetch.prerequisite(), Some(StepKind::Build));
        assert_eq!(StepKind::ParseAgain.prerequisite(), Some(StepKind::Fetch));
        assert_eq!(StepKind::Report.prerequisite(), Some(StepKind::ParseAgain));
        assert_eq!(StepKind::Custom.prerequisite(), None);
    }

    #[test]
    fn test_completed_steps_persist() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("exp").join("steps.json");

        let mut steps = CompletedSteps::load(&path);
        assert!(!steps.contains(BUILD_STEP));
        steps.mark(BUILD_STEP).unwrap();
        steps.mark(START_STEP).unwrap();

        let reloaded = CompletedSteps::load(&path);
        assert!(reloaded.contains(BUILD_STEP));
        assert!(reloaded.contains(START_STEP));
        assert!(!reloaded.contains(REPORT_STEP));
    }

    #[test]
    fn test_corrupt_record_starts_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("steps.json");
        fs::write(&path, "{\"completed\": [").unwrap();

        let mut steps = CompletedSteps::load(&path);
        assert!(steps.names().next().is_none());
        // The next mark overwrites the corrupt file.
        steps.mark(BUILD_STEP).unwrap();
        assert!(CompletedSteps::load(&path).contains(BUILD_STEP));
    }

    #[test]
    fn test_custom_action_debug() {
        let action = StepAction::Custom(Box::new(|_| Ok(())));
        assert_eq!(format!("{:?}", action), "Custom(..)");
        assert_eq!(format!("{:?}", StepAction::Fetch), "Fetch");
    }
}
