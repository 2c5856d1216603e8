//! Parser built from an ordered list of extraction patterns.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pattern::{ExtractionPattern, PatternDecl};
use super::{AttributeValue, Parser, PartialRecord, RunArtifacts};
use crate::error::ParserError;

/// YAML layout of a parser file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserFile {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<PatternDecl>,
}

/// Applies its patterns, in declaration order, to one run's artifacts.
#[derive(Debug, Clone)]
pub struct PatternParser {
    name: String,
    source: Option<PathBuf>,
    patterns: Vec<ExtractionPattern>,
}

impl PatternParser {
    /// Creates an empty parser identified by `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            patterns: Vec::new(),
        }
    }

    /// Loads a parser from a YAML file, remembering the file as its source.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ParserError> {
        let content = fs::read_to_string(path).map_err(|source| ParserError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut parser = Self::from_yaml_str(&content)?;
        parser.source = Some(path.to_path_buf());
        Ok(parser)
    }

    /// Parses a parser declaration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ParserError> {
        let file: ParserFile = serde_yaml::from_str(content)?;
        let mut parser = Self::new(file.name);
        for decl in &file.patterns {
            parser.add_pattern(ExtractionPattern::from_decl(decl)?)?;
        }
        Ok(parser)
    }

    /// Adds a pattern; attribute names are unique within a parser.
    pub fn add_pattern(&mut self, pattern: ExtractionPattern) -> Result<(), ParserError> {
        if self.patterns.iter().any(|p| p.name() == pattern.name()) {
            return Err(ParserError::DuplicateAttribute(pattern.name().to_string()));
        }
        self.patterns.push(pattern);
        Ok(())
    }

    /// Builder-style variant of [`add_pattern`](Self::add_pattern).
    pub fn with_pattern(mut self, pattern: ExtractionPattern) -> Result<Self, ParserError> {
        self.add_pattern(pattern)?;
        Ok(self)
    }

    pub fn patterns(&self) -> &[ExtractionPattern] {
        &self.patterns
    }

    /// The file this parser was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl Parser for PatternParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, artifacts: &RunArtifacts) -> PartialRecord {
        let mut record = PartialRecord::default();
        // Several patterns usually share one file; read each file once.
        let mut contents: HashMap<&str, Result<Option<String>, String>> = HashMap::new();

        for pattern in &self.patterns {
            let content = contents.entry(pattern.file()).or_insert_with(|| {
                artifacts
                    .read(pattern.file())
                    .map_err(|e| format!("cannot read {}: {}", pattern.file(), e))
            });

            let value = match content {
                Ok(text) => pattern.apply(text.as_deref()).into_value(),
                Err(message) => AttributeValue::Error(message.clone()),
            };
            if let AttributeValue::Error(ref message) = value {
                debug!("Run {}: {}: {}", artifacts.run_id(), pattern.name(), message);
                record.errors.push((pattern.name().to_string(), message.clone()));
            }
            record.values.insert(pattern.name().to_string(), value);
        }

        record
    }
}
