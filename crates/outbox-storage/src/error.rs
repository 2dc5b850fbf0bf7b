//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A row with the same identity already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Tenant identifier cannot be used in keys
    #[error("Invalid tenant: {0}")]
    InvalidTenant(String),

    /// Internal lock was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    ///
    /// Engine failures are transient; logical errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::RocksDb(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Conflict("agent 01H".to_string());
        assert_eq!(err.to_string(), "Conflict: agent 01H");

        let err = StorageError::InvalidTenant("a:b".to_string());
        assert_eq!(err.to_string(), "Invalid tenant: a:b");
    }

    #[test]
    fn test_transient_classification() {
        assert!(!StorageError::Conflict("x".into()).is_transient());
        assert!(!StorageError::NotFound("x".into()).is_transient());
        assert!(!StorageError::Serialization("x".into()).is_transient());
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: StorageError = json_err.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
