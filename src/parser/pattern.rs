//! Declarative extraction patterns.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::value::{AttributeValue, ValueType};
use crate::error::ParserError;

/// Default artifact file scanned by a pattern: the solver's stdout capture.
pub const DEFAULT_SOURCE_FILE: &str = crate::experiment::layout::RUN_LOG;

/// How a pattern's expression is applied to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Matched against every line, anchored at the line start.
    #[default]
    Line,
    /// One search across the whole file content.
    File,
}

/// Which matches contribute when a pattern matches more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    First,
    #[default]
    Last,
    /// Every match, as an `AttributeValue::List`.
    All,
}

/// Serializable form of a pattern, as written in parser YAML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDecl {
    pub name: String,
    pub regex: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub aggregate: Aggregation,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub file: Option<String>,
}

/// A compiled extraction rule mapping a text match to a typed attribute.
#[derive(Debug, Clone)]
pub struct ExtractionPattern {
    name: String,
    source: String,
    regex: Regex,
    value_type: ValueType,
    mode: MatchMode,
    aggregation: Aggregation,
    required: bool,
    file: String,
}

/// Result of applying a pattern to one run.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternOutcome {
    Matched(AttributeValue),
    /// No match in an optional pattern.
    Absent,
    /// No match in a required pattern.
    MissingRequired(String),
}

impl PatternOutcome {
    /// Collapses the outcome into the value stored in the attribute record.
    pub fn into_value(self) -> AttributeValue {
        match self {
            PatternOutcome::Matched(value) => value,
            PatternOutcome::Absent => AttributeValue::Absent,
            PatternOutcome::MissingRequired(message) => AttributeValue::Error(message),
        }
    }
}

impl ExtractionPattern {
    /// Creates a line-mode, optional string pattern scanning `run.log`.
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, ParserError> {
        let name = name.into();
        let regex = compile(&name, pattern, MatchMode::Line)?;
        Ok(Self {
            name,
            source: pattern.to_string(),
            regex,
            value_type: ValueType::Str,
            mode: MatchMode::Line,
            aggregation: Aggregation::default(),
            required: false,
            file: DEFAULT_SOURCE_FILE.to_string(),
        })
    }

    /// Builds a pattern from its declaration.
    pub fn from_decl(decl: &PatternDecl) -> Result<Self, ParserError> {
        let mut pattern = Self::new(&decl.name, &decl.regex)?
            .with_type(decl.value_type)
            .with_aggregation(decl.aggregate)
            .required(decl.required);
        pattern = pattern.with_mode(decl.mode)?;
        if let Some(ref file) = decl.file {
            pattern = pattern.with_file(file);
        }
        Ok(pattern)
    }

    /// Sets the target value type.
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Sets the match mode, recompiling the expression.
    pub fn with_mode(mut self, mode: MatchMode) -> Result<Self, ParserError> {
        self.regex = compile(&self.name, &self.source, mode)?;
        self.mode = mode;
        Ok(self)
    }

    /// Sets the aggregation policy for multiple matches.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Marks the pattern as required or optional.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Overrides the artifact file scanned by this pattern.
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Applies the pattern to file content; `None` means the file is absent.
    pub fn apply(&self, content: Option<&str>) -> PatternOutcome {
        let captures = match content {
            Some(text) => self.collect(text),
            None => Vec::new(),
        };

        if captures.is_empty() {
            return if self.required {
                PatternOutcome::MissingRequired(format!(
                    "required attribute '{}' not found in {}",
                    self.name, self.file
                ))
            } else {
                PatternOutcome::Absent
            };
        }

        let value = match self.aggregation {
            Aggregation::All => {
                let values: Vec<AttributeValue> =
                    captures.iter().map(|raw| self.value_type.convert(raw)).collect();
                match values.iter().find(|v| v.is_error()) {
                    Some(err) => err.clone(),
                    None => AttributeValue::List(values),
                }
            }
            Aggregation::First => self.value_type.convert(&captures[0]),
            Aggregation::Last => self.value_type.convert(&captures[captures.len() - 1]),
        };
        PatternOutcome::Matched(value)
    }

    /// Returns the captured text of every relevant match, in file order.
    fn collect<'t>(&self, text: &'t str) -> Vec<&'t str> {
        match self.mode {
            MatchMode::Line => text
                .lines()
                .filter_map(|line| self.regex.captures(line).map(|c| capture_text(&c)))
                .collect(),
            MatchMode::File => {
                if self.aggregation == Aggregation::All {
                    self.regex
                        .captures_iter(text)
                        .map(|c| capture_text(&c))
                        .collect()
                } else {
                    self.regex
                        .captures(text)
                        .map(|c| vec![capture_text(&c)])
                        .unwrap_or_default()
                }
            }
        }
    }
}

/// Group 1 when the expression has one, the whole match otherwise.
fn capture_text<'t>(captures: &regex::Captures<'t>) -> &'t str {
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str())
        .unwrap_or_default()
}

fn compile(name: &str, pattern: &str, mode: MatchMode) -> Result<Regex, ParserError> {
    let expr = match mode {
        MatchMode::Line => format!("^(?:{})", pattern),
        MatchMode::File => pattern.to_string(),
    };
    Regex::new(&expr).map_err(|e| ParserError::InvalidRegex {
        attribute: name.to_string(),
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}
