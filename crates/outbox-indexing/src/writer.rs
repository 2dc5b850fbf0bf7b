//! Index writer collaborator contract.

use crate::error::IndexingError;
use crate::operation::IndexOperation;

/// Applies index operations.
///
/// Implementations must be safe to call twice with the same operations:
/// the second call leaves the index exactly as the first did. A call either
/// applies every operation or none of them.
pub trait IndexWriter: Send + Sync {
    /// Apply `operations` and make them durable.
    fn apply(&self, operations: &[IndexOperation]) -> Result<(), IndexingError>;

    /// Get the name of this writer for logging.
    fn name(&self) -> &str;
}
