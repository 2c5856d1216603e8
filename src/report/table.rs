//! The attribute table: one record per run, in run registration order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::parser::{AttributeValue, PartialRecord};

static ABSENT: AttributeValue = AttributeValue::Absent;

/// An error recorded against one attribute of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub attribute: String,
    pub message: String,
}

/// All attributes known about a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub run_id: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub errors: Vec<RecordError>,
}

impl AttributeRecord {
    /// Creates an empty record for a run.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            attributes: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Returns the attribute, or the absent marker when it was never set.
    pub fn get(&self, attribute: &str) -> &AttributeValue {
        self.attributes.get(attribute).unwrap_or(&ABSENT)
    }

    /// Sets an attribute, replacing any previous value.
    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    /// Records an error and marks the attribute with it.
    pub fn record_error(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
        let attribute = attribute.into();
        let message = message.into();
        self.attributes
            .insert(attribute.clone(), AttributeValue::Error(message.clone()));
        self.errors.push(RecordError { attribute, message });
    }

    /// Merges a parser's output; later parsers override earlier values.
    pub fn merge(&mut self, partial: PartialRecord) {
        self.attributes.extend(partial.values);
        self.errors.extend(
            partial
                .errors
                .into_iter()
                .map(|(attribute, message)| RecordError { attribute, message }),
        );
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Ordered snapshot of every run's attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeTable {
    records: Vec<AttributeRecord>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: AttributeRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[AttributeRecord] {
        &self.records
    }

    pub fn get(&self, run_id: &str) -> Option<&AttributeRecord> {
        self.records.iter().find(|r| r.run_id == run_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records with at least one recorded error.
    pub fn error_count(&self) -> usize {
        self.records.iter().filter(|r| r.has_errors()).count()
    }

    /// Writes the table as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    /// Loads a table previously written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
