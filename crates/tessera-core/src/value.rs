//! Field values stored in document registers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A document's materialized fields, ordered by name.
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("non-finite float cannot be stored")]
    NonFiniteFloat,
}

/// A value held by a register field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Reject values that cannot round-trip through the delta codec.
    pub fn validate(&self) -> Result<(), ValueError> {
        match self {
            FieldValue::Float(f) if !f.is_finite() => Err(ValueError::NonFiniteFloat),
            FieldValue::List(items) => items.iter().try_for_each(|v| v.validate()),
            _ => Ok(()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Plain JSON form used when exporting flattened documents.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => Value::from(*f),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Bytes(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            FieldValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}
