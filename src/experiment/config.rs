//! Experiment configuration.
//!
//! Everything that used to be process-wide (output paths, pool width, time
//! limits) lives here and is passed to `Experiment::new` explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::layout::ExperimentLayout;
use crate::error::ConfigError;

/// Configuration for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Directory where run directories are generated.
    pub path: PathBuf,
    /// Directory receiving fetched artifacts, the attribute table and reports.
    /// Defaults to `<path>-eval`.
    pub eval_dir: Option<PathBuf>,
    /// Number of parallel processes for local execution.
    pub processes: usize,
    /// Wall-clock limit per run, in seconds.
    pub time_limit_secs: u64,
    /// Seconds a local run may overrun its limit before it is killed.
    pub kill_margin_secs: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/exp"),
            eval_dir: None,
            processes: 4,
            time_limit_secs: 1800,
            kill_margin_secs: 5,
        }
    }
}

impl ExperimentConfig {
    /// Creates a configuration for an experiment at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LAB_EXPERIMENT_PATH`: Experiment directory (default: ./data/exp)
    /// - `LAB_EVAL_DIR`: Evaluation directory (default: `<path>-eval`)
    /// - `LAB_PROCESSES`: Local pool width (default: 4)
    /// - `LAB_TIME_LIMIT_SECS`: Per-run wall-clock limit (default: 1800)
    /// - `LAB_KILL_MARGIN_SECS`: Grace period before a local run is killed (default: 5)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("LAB_EXPERIMENT_PATH") {
            self.path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LAB_EVAL_DIR") {
            self.eval_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("LAB_PROCESSES") {
            self.processes = parse_env_value(&val, "LAB_PROCESSES")?;
        }

        if let Ok(val) = std::env::var("LAB_TIME_LIMIT_SECS") {
            self.time_limit_secs = parse_env_value(&val, "LAB_TIME_LIMIT_SECS")?;
        }

        if let Ok(val) = std::env::var("LAB_KILL_MARGIN_SECS") {
            self.kill_margin_secs = parse_env_value(&val, "LAB_KILL_MARGIN_SECS")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "path cannot be empty".to_string(),
            ));
        }

        if self.processes == 0 {
            return Err(ConfigError::ValidationFailed(
                "processes must be greater than 0".to_string(),
            ));
        }

        if self.time_limit_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "time_limit_secs must be greater than 0".to_string(),
            ));
        }

        if self.eval_dir.as_deref() == Some(self.path.as_path()) {
            return Err(ConfigError::ValidationFailed(
                "eval_dir must differ from path".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the evaluation directory.
    pub fn with_eval_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.eval_dir = Some(dir.into());
        self
    }

    /// Sets the local pool width.
    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    /// Sets the per-run wall-clock limit.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_secs = limit.as_secs();
        self
    }

    /// Sets the grace period past the limit before a local run is killed.
    pub fn with_kill_margin(mut self, margin: Duration) -> Self {
        self.kill_margin_secs = margin.as_secs();
        self
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn kill_margin(&self) -> Duration {
        Duration::from_secs(self.kill_margin_secs)
    }

    /// Resolves the on-disk layout.
    pub fn layout(&self) -> ExperimentLayout {
        let eval_dir = self
            .eval_dir
            .clone()
            .unwrap_or_else(|| ExperimentLayout::default_eval_dir(&self.path));
        ExperimentLayout::new(&self.path, eval_dir)
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.processes, 4);
        assert_eq!(config.time_limit(), Duration::from_secs(1800));
        assert_eq!(config.kill_margin(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ExperimentConfig::new("/tmp/exp")
            .with_processes(2)
            .with_time_limit(Duration::from_secs(60))
            .with_eval_dir("/tmp/results")
            .with_kill_margin(Duration::ZERO);

        assert_eq!(config.processes, 2);
        assert_eq!(config.kill_margin_secs, 0);
        assert_eq!(config.time_limit_secs, 60);
        assert_eq!(config.layout().eval_dir(), Path::new("/tmp/results"));
    }

    #[test]
    fn test_default_layout() {
        let config = ExperimentConfig::new("/tmp/exp");
        assert_eq!(config.layout().eval_dir(), Path::new("/tmp/exp-eval"));
    }

    #[test]
    fn test_validation() {
        assert!(ExperimentConfig::new("x").with_processes(0).validate().is_err());
        assert!(ExperimentConfig::new("x")
            .with_time_limit(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ExperimentConfig::new("x").with_eval_dir("x").validate().is_err());
    }

    #[test]
    fn test_from_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("experiment.yaml");
        std::fs::write(&path, "path: /scratch/exp\nprocesses: 8\n").unwrap();

        let config = ExperimentConfig::from_yaml_file(&path).unwrap();
        // Unset keys keep their defaults.
        assert_eq!(config.time_limit_secs, 1800);
        if std::env::var("LAB_PROCESSES").is_err() {
            assert_eq!(config.processes, 8);
        }
    }

    #[test]
    fn test_parse_env_value() {
        let n: usize = parse_env_value("12", "KEY").unwrap();
        assert_eq!(n, 12);
        assert!(parse_env_value::<usize>("twelve", "KEY").is_err());
    }
}
