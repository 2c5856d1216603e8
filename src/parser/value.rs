//! Typed attribute values extracted from run artifacts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParserError;

/// A single attribute value in an attribute record.
///
/// `Absent` and `Error` are first-class values so that reports can tell
/// "not present" apart from "present and falsy" and from "extraction failed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Str(String),
    Int(i64),
    Float(f64),
    /// Every match of a collect-all pattern, in file order.
    List(Vec<AttributeValue>),
    Absent,
    Error(String),
}

impl AttributeValue {
    /// Returns true for the missing marker.
    pub fn is_absent(&self) -> bool {
        matches!(self, AttributeValue::Absent)
    }

    /// Returns true for a recorded extraction error.
    pub fn is_error(&self) -> bool {
        matches!(self, AttributeValue::Error(_))
    }

    /// Returns the numeric value of an `Int` or `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload of a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Str(s) => write!(f, "{}", s),
            AttributeValue::Int(v) => write!(f, "{}", v),
            // Keeps the decimal point, so 60.0 does not read back as an integer.
            AttributeValue::Float(v) => write!(f, "{:?}", v),
            AttributeValue::List(values) => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", value)?;
                }
                Ok(())
            }
            AttributeValue::Absent => Ok(()),
            AttributeValue::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Str(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(AttributeValue::Absent)
    }
}

/// Declared target type of an extraction pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Str,
    Int,
    Float,
}

impl ValueType {
    /// Converts captured text to a value of this type.
    ///
    /// A conversion failure is returned as `AttributeValue::Error`, never as
    /// a panic or a silent default.
    pub fn convert(&self, raw: &str) -> AttributeValue {
        match self {
            ValueType::Str => AttributeValue::Str(raw.to_string()),
            ValueType::Int => match raw.trim().parse::<i64>() {
                Ok(v) => AttributeValue::Int(v),
                Err(e) => AttributeValue::Error(format!("cannot convert '{}' to int: {}", raw, e)),
            },
            ValueType::Float => match raw.trim().parse::<f64>() {
                Ok(v) => AttributeValue::Float(v),
                Err(e) => {
                    AttributeValue::Error(format!("cannot convert '{}' to float: {}", raw, e))
                }
            },
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Str => write!(f, "str"),
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
        }
    }
}

impl FromStr for ValueType {
    type Err = ParserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "str" | "string" => Ok(ValueType::Str),
            "int" | "integer" => Ok(ValueType::Int),
            "float" | "f64" => Ok(ValueType::Float),
            other => Err(ParserError::UnknownValueType(other.to_string())),
        }
    }
}
