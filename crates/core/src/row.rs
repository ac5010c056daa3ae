//! Row images exchanged with the store

use crate::types::Identifier;
use crate::value::Value;
use crate::version::Version;
use serde::{Deserialize, Serialize};

/// One column of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    /// Basic property value
    Value(Value),
    /// Foreign key of a many-to-one association
    Reference(Option<Identifier>),
    /// Placeholder for a collection property; elements are stored separately
    Collection,
}

impl ColumnValue {
    /// Whether the column holds SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Value(Value::Null) | ColumnValue::Reference(None))
    }

    /// Foreign key, if this is a non-null reference
    pub fn reference(&self) -> Option<&Identifier> {
        match self {
            ColumnValue::Reference(id) => id.as_ref(),
            _ => None,
        }
    }
}

/// Image of an entity row: one column per mapped property plus the version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Columns in property order
    pub columns: Vec<ColumnValue>,
    /// Version column for versioned entities
    pub version: Option<Version>,
}

impl Row {
    /// Create a row
    pub fn new(columns: Vec<ColumnValue>, version: Option<Version>) -> Self {
        Self { columns, version }
    }
}
