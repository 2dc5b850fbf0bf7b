//! Translation of outbox events into index operations.

use outbox_types::{EntityChange, OutboxEvent};
use serde_json::Value;

use crate::error::IndexingError;
use crate::operation::IndexOperation;

/// Stable document id of an entity: `{entity_name}:{entity_id}`.
pub fn document_id(entity_name: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_name, entity_id)
}

/// Translate one event into the operations that bring the index in line
/// with the change it describes.
///
/// Fails with [`IndexingError::MalformedEvent`] when the payload has no
/// indexable shape; such an event fails identically on every delivery.
pub fn translate(event: &OutboxEvent) -> Result<Vec<IndexOperation>, IndexingError> {
    if event.entity_name.is_empty() || event.entity_id.is_empty() {
        return Err(IndexingError::MalformedEvent {
            sequence: event.sequence,
            reason: "entity name and id must be non-empty".to_string(),
        });
    }

    let document_id = document_id(&event.entity_name, &event.entity_id);
    match &event.change {
        EntityChange::Upsert {
            document: Value::Object(fields),
        } => Ok(vec![IndexOperation::Upsert {
            document_id,
            entity_name: event.entity_name.clone(),
            fields: fields.clone(),
        }]),
        EntityChange::Upsert { document } => Err(IndexingError::MalformedEvent {
            sequence: event.sequence,
            reason: format!("document must be a JSON object, got {}", json_kind(document)),
        }),
        EntityChange::Delete => Ok(vec![IndexOperation::Delete { document_id }]),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
