//! Index operations produced from outbox events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One change to the secondary index, keyed on the entity's stable identity.
///
/// Keying on identity, never on position, is what lets a redelivered event
/// be applied again without changing the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexOperation {
    /// Replace the document stored under `document_id`
    Upsert {
        document_id: String,
        entity_name: String,
        fields: Map<String, Value>,
    },
    /// Remove the document stored under `document_id`
    Delete { document_id: String },
}

impl IndexOperation {
    pub fn document_id(&self) -> &str {
        match self {
            IndexOperation::Upsert { document_id, .. } => document_id,
            IndexOperation::Delete { document_id } => document_id,
        }
    }
}
