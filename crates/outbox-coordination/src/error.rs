//! Error types for the coordination crate.

use outbox_indexing::IndexingError;
use outbox_storage::StorageError;
use outbox_types::AgentState;
use thiserror::Error;

/// Errors that can occur while coordinating agents.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Agent store or outbox failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another agent row already uses this id; fatal to startup
    #[error("Agent conflict: {0}")]
    Conflict(String),

    #[error("Agent is already started")]
    AlreadyStarted,

    #[error("Agent is not started")]
    NotStarted,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    /// A background task panicked or was aborted
    #[error("Task join error: {0}")]
    Join(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<tokio::task::JoinError> for CoordinationError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoordinationError::Join(err.to_string())
    }
}

impl CoordinationError {
    /// Map a storage conflict onto the fatal startup error.
    pub(crate) fn from_registration(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => CoordinationError::Conflict(msg),
            other => CoordinationError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinationError::InvalidTransition {
            from: AgentState::Stopped,
            to: AgentState::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from stopped to running"
        );

        let err = CoordinationError::InvalidConfig("batch_size must be > 0".into());
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_registration_conflict_is_fatal_kind() {
        let err = CoordinationError::from_registration(StorageError::Conflict("dup".into()));
        assert!(matches!(err, CoordinationError::Conflict(_)));

        let err = CoordinationError::from_registration(StorageError::NotFound("x".into()));
        assert!(matches!(err, CoordinationError::Storage(_)));
    }
}
