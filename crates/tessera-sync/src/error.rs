//! Error types for peer synchronization.

use crate::network::PeerId;
use std::time::Duration;
use tessera_core::DocId;
use tessera_db::DbError;
use tessera_merkle::StoreError;
use thiserror::Error;

/// Transport-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Peer unreachable: {0}")]
    Unreachable(PeerId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Request to {0} timed out")]
    Timeout(PeerId),

    #[error("Connection closed")]
    Closed,

    #[error("Transport already subscribed")]
    AlreadySubscribed,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Peer refused request: {reason}")]
    Remote { reason: String, retryable: bool },
}

impl NetworkError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetworkError::Unreachable(_)
                | NetworkError::PeerNotFound(_)
                | NetworkError::Timeout(_)
                | NetworkError::Closed
                | NetworkError::Remote { retryable: true, .. }
        )
    }
}

/// Errors returned by the sync engine.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Cannot replicate to the local peer")]
    SelfTargetReplicator,

    #[error("Replicator not found: {0}")]
    ReplicatorNotFound(PeerId),

    #[error("Invalid block from {peer}: {reason}")]
    Integrity { peer: PeerId, reason: String },

    #[error("No peer could supply the history of {0}")]
    Incomplete(DocId),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SyncError {
    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(e) => e.is_retryable(),
            SyncError::Db(e) => e.is_retryable(),
            SyncError::Store(e) => e.is_retryable(),
            SyncError::Timeout(_) | SyncError::Incomplete(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
