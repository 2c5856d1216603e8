//! Pattern-based log parsing.
//!
//! Parsers turn the unstructured text artifacts of a run (solver stdout, the
//! driver log, ...) into typed attributes. Extraction rules are declarative,
//! so they can be replayed against already-fetched logs without re-running
//! the solver.
//!
//! # Example
//!
//! ```ignore
//! use solver_lab::parser::{ExtractionPattern, PatternParser, ValueType};
//!
//! let parser = PatternParser::new("pumpkin")
//!     .with_pattern(ExtractionPattern::new("status", r"s ([A-Z]+)$")?)?
//!     .with_pattern(
//!         ExtractionPattern::new("solve_time", r"solve wall-clock time: ([0-9\.]+)s$")?
//!             .with_type(ValueType::Float)
//!             .with_file("driver.log")
//!             .required(true),
//!     )?;
//! ```

pub mod pattern;
pub mod pattern_parser;
pub mod value;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use pattern::{Aggregation, ExtractionPattern, MatchMode, PatternDecl, PatternOutcome};
pub use pattern_parser::{ParserFile, PatternParser};
pub use value::{AttributeValue, ValueType};

/// The fetched artifact directory of a single run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    run_id: String,
    dir: PathBuf,
}

impl RunArtifacts {
    pub fn new(run_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            dir: dir.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads an artifact file as text; `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `NotFound`, e.g. when the path is a
    /// directory or not readable.
    pub fn read(&self, file: &str) -> std::io::Result<Option<String>> {
        match fs::read(self.dir.join(file)) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Attributes produced by one parser for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRecord {
    pub values: BTreeMap<String, AttributeValue>,
    /// `(attribute, message)` for every attribute stored as an error: a
    /// missing required match, a failed conversion or an unreadable file.
    pub errors: Vec<(String, String)>,
}

/// Capability interface for anything that extracts attributes from run artifacts.
///
/// Implementations must not fail as a whole: problems with a single attribute
/// are reported through `AttributeValue::Error` and `PartialRecord::errors`.
pub trait Parser: Send + Sync {
    /// Identifies the parser, usually the file it was declared in.
    fn name(&self) -> &str;

    /// Extracts attributes from one run's artifacts.
    fn apply(&self, artifacts: &RunArtifacts) -> PartialRecord;
}
