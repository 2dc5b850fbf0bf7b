//! Error types for event dispatch.

use outbox_search::SearchError;
use outbox_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while dispatching events
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Event payload cannot be turned into index operations
    #[error("Malformed event {sequence}: {reason}")]
    MalformedEvent { sequence: u64, reason: String },

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic index operation error
    #[error("Index error: {0}")]
    Index(String),

    /// Search index error
    #[error("Search error: {0}")]
    Search(#[from] SearchError),
}

impl IndexingError {
    /// Whether the same call may succeed later.
    ///
    /// A malformed payload fails the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexingError::Storage(e) => e.is_transient(),
            IndexingError::MalformedEvent { .. } | IndexingError::Serialization(_) => false,
            IndexingError::Index(_) | IndexingError::Search(_) => true,
        }
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}
