//! Persistence contracts consumed by the coordination core.
//!
//! The core never talks to RocksDB directly; it sees agent rows through
//! [`AgentStore`] and events through [`OutboxEventSource`]. Both are
//! synchronous, like the engine beneath them, and callers in async code
//! run them on the blocking pool.
//!
//! Neither contract retries internally. Transient failures reach the caller.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outbox_types::{Agent, AgentId, OutboxEvent};

use crate::error::StorageError;

/// Durable CRUD over agent rows of one tenant.
pub trait AgentStore: Send + Sync {
    /// Insert a new row. Fails with [`StorageError::Conflict`] if the id exists.
    fn create(&self, agent: &Agent) -> Result<(), StorageError>;

    /// Fetch a row by id.
    fn find(&self, id: &AgentId) -> Result<Option<Agent>, StorageError>;

    /// Every row, ordered by id.
    fn list_all_ordered_by_id(&self) -> Result<Vec<Agent>, StorageError>;

    /// Overwrite an existing row. Fails with [`StorageError::NotFound`] if
    /// the row was deleted.
    fn update(&self, agent: &Agent) -> Result<(), StorageError>;

    /// Remove rows. Absent ids are ignored.
    fn delete(&self, ids: &[AgentId]) -> Result<(), StorageError>;
}

/// The shards an agent may read, in a shard space of `total` shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFilter {
    pub shards: BTreeSet<u32>,
    pub total: u32,
}

impl ShardFilter {
    pub fn new(shards: BTreeSet<u32>, total: u32) -> Self {
        Self { shards, total }
    }

    /// Filter accepting every shard.
    pub fn all(total: u32) -> Self {
        Self {
            shards: (0..total).collect(),
            total,
        }
    }

    /// Whether `event` falls into one of the filtered shards.
    pub fn matches(&self, event: &OutboxEvent) -> bool {
        self.total > 0 && self.shards.contains(&event.shard_index(self.total))
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Retry budget of failed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures after which the event is poisoned
    pub max_retries: u32,
    /// Delay before a failed event becomes eligible again
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Whether an event that has failed `retries` times is exhausted.
    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}

/// What recording a failure did to the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Left pending; redelivered no earlier than `process_after`
    Retry {
        attempt: u32,
        process_after: DateTime<Utc>,
    },
    /// Moved to the poison store after `attempts` failures
    Poisoned { attempts: u32 },
    /// The event no longer exists, e.g. another owner acknowledged it
    AlreadyProcessed,
}

/// Read and settle outbox events of one tenant.
pub trait OutboxEventSource: Send + Sync {
    /// Up to `max_count` pending events in `filter`, ascending by sequence.
    /// Events whose `process_after` lies after `now` are skipped.
    fn fetch_batch(
        &self,
        filter: &ShardFilter,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, StorageError>;

    /// Remove a processed event. Acknowledging an absent event is a no-op.
    fn acknowledge(&self, sequence: u64) -> Result<(), StorageError>;

    /// Count a failed attempt and apply `policy`.
    fn record_failure(
        &self,
        sequence: u64,
        reason: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_types::EntityChange;

    #[test]
    fn test_shard_filter_matches() {
        let event = OutboxEvent::new(1, "t", "book", "book-1", EntityChange::Delete, Utc::now());
        let shard = event.shard_index(4);

        let only = ShardFilter::new([shard].into_iter().collect(), 4);
        assert!(only.matches(&event));

        let others = ShardFilter::new((0..4).filter(|s| *s != shard).collect(), 4);
        assert!(!others.matches(&event));

        assert!(ShardFilter::all(4).matches(&event));
        assert!(!ShardFilter::new(BTreeSet::new(), 0).matches(&event));
    }

    #[test]
    fn test_retry_policy_exhaustion() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }
}
