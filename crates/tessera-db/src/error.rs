//! Error types for the database layer.

use crate::collection::FieldKind;
use tessera_core::{DocId, ValueError};
use tessera_merkle::{ClockError, StoreError};
use thiserror::Error;

/// Errors that can occur in database operations.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection {0} already exists with a different definition")]
    CollectionExists(String),

    #[error("Invalid collection definition: {0}")]
    InvalidCollection(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(DocId),

    #[error("Document already exists: {0}")]
    DocumentExists(DocId),

    #[error("Document is deleted: {0}")]
    DocumentDeleted(DocId),

    #[error("Document {doc_id} belongs to collection {actual}, not {requested}")]
    WrongCollection {
        doc_id: DocId,
        requested: String,
        actual: String,
    },

    #[error("Batch for document {expected} contains a block of {actual}")]
    MixedBatch { expected: DocId, actual: DocId },

    #[error("Field {field} is not defined on collection {collection}")]
    FieldNotFound { collection: String, field: String },

    #[error("Field {field} is a {actual:?} field, operation needs {expected:?}")]
    FieldKindMismatch {
        field: String,
        expected: FieldKind,
        actual: FieldKind,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(#[from] ValueError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Merkle clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DbError {
    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Store(e) => e.is_retryable(),
            DbError::Clock(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The offending block is invalid and should be discarded.
    pub fn is_integrity(&self) -> bool {
        match self {
            DbError::Clock(e) => e.is_integrity(),
            DbError::MixedBatch { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
