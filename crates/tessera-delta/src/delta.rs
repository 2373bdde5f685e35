use serde::{Deserialize, Serialize};
use tessera_core::{DocId, FieldValue};

/// Document status carried by composite deltas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Active,
    Deleted,
}

/// The mutation a delta applies to its register.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    /// Overwrite a register field.
    Set(FieldValue),
    /// Delete a register field.
    Tombstone,
    /// Add a signed amount to a counter field.
    Increment(i64),
    /// Document-level status, written to the composite DAG.
    Composite(DocStatus),
}

impl DeltaOp {
    pub fn is_counter(&self) -> bool {
        matches!(self, DeltaOp::Increment(_))
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, DeltaOp::Composite(_))
    }
}

/// A single field mutation plus its causal metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Delta {
    pub doc_id: DocId,
    pub field: String,
    /// `None` for deltas written before schema versions were tracked.
    pub schema_version_id: Option<String>,
    /// Height of the block carrying this delta.
    pub priority: u64,
    pub op: DeltaOp,
}

impl Delta {
    pub fn new(doc_id: DocId, field: impl Into<String>, op: DeltaOp) -> Self {
        Self {
            doc_id,
            field: field.into(),
            schema_version_id: None,
            priority: 0,
            op,
        }
    }

    pub fn with_schema_version(mut self, id: impl Into<String>) -> Self {
        self.schema_version_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }
}
