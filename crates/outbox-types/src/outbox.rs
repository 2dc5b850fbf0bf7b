//! Outbox event type consumed by agents.
//!
//! Events are appended by the transactional write path alongside the data
//! change they describe. An agent owning the event's shard translates it to
//! index operations, applies them and then acknowledges the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::shard_key_for;

/// The change an event describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityChange {
    /// Entity was created or updated; `document` is its indexable form
    Upsert { document: serde_json::Value },
    /// Entity was deleted
    Delete,
}

/// A durable change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonically increasing sequence number
    pub sequence: u64,

    pub tenant_id: String,

    /// Entity type, e.g. "book"
    pub entity_name: String,

    /// Stable identity of the changed entity
    pub entity_id: String,

    /// Hash of `entity_id`; the shard is `shard_key % total_shard_count`
    pub shard_key: u32,

    pub change: EntityChange,

    /// Failed processing attempts so far
    #[serde(default)]
    pub retries: u32,

    /// Not eligible for delivery before this instant
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub process_after: Option<DateTime<Utc>>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Reason of the most recent failure
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Create a new pending event. The shard key is derived from `entity_id`.
    pub fn new(
        sequence: u64,
        tenant_id: impl Into<String>,
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        change: EntityChange,
        created_at: DateTime<Utc>,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            sequence,
            tenant_id: tenant_id.into(),
            entity_name: entity_name.into(),
            shard_key: shard_key_for(&entity_id),
            entity_id,
            change,
            retries: 0,
            process_after: None,
            created_at,
            last_error: None,
        }
    }

    /// Shard index of this event in a shard space of `total` shards.
    ///
    /// `total` must be non-zero.
    pub fn shard_index(&self, total: u32) -> u32 {
        self.shard_key % total
    }

    /// Whether the event may be delivered at `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.process_after.map_or(true, |after| after <= now)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn upsert(entity_id: &str) -> OutboxEvent {
        OutboxEvent::new(
            7,
            "acme",
            "book",
            entity_id,
            EntityChange::Upsert {
                document: json!({"title": "Dune"}),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_shard_index_is_deterministic() {
        let a = upsert("book-1");
        let b = upsert("book-1");
        assert_eq!(a.shard_key, b.shard_key);
        for total in 1..16 {
            assert_eq!(a.shard_index(total), b.shard_index(total));
            assert!(a.shard_index(total) < total);
        }
    }

    #[test]
    fn test_is_due_at() {
        let now = Utc::now();
        let mut event = upsert("book-1");
        assert!(event.is_due_at(now));

        event.process_after = Some(now + Duration::seconds(5));
        assert!(!event.is_due_at(now));
        assert!(event.is_due_at(now + Duration::seconds(5)));
    }

    #[test]
    fn test_change_serialization_is_tagged() {
        let json = serde_json::to_value(EntityChange::Delete).unwrap();
        assert_eq!(json, json!({"kind": "delete"}));

        let decoded = OutboxEvent::from_bytes(&upsert("book-9").to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.entity_id, "book-9");
        assert!(matches!(decoded.change, EntityChange::Upsert { .. }));
        assert_eq!(decoded.retries, 0);
        assert!(decoded.process_after.is_none());
    }
}
