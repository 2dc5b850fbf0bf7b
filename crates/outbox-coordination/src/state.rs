//! The agent's published assignment.
//!
//! The monitor replaces the whole snapshot after each recomputation; the
//! poller only ever reads a complete one.

use std::collections::BTreeSet;

use outbox_storage::ShardFilter;
use outbox_types::OutboxEvent;

/// Shards this agent may process, as of one monitor cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentSnapshot {
    /// Bumped on every published change
    pub generation: u64,
    pub total_shard_count: u32,
    pub shards: BTreeSet<u32>,
    /// False while alive processors disagree on the shard count
    pub processing_enabled: bool,
}

impl AssignmentSnapshot {
    /// The snapshot before the first assignment: nothing owned.
    pub fn initial(total_shard_count: u32) -> Self {
        Self {
            generation: 0,
            total_shard_count,
            shards: BTreeSet::new(),
            processing_enabled: false,
        }
    }

    pub fn owns(&self, event: &OutboxEvent) -> bool {
        self.processing_enabled
            && self.total_shard_count > 0
            && self
                .shards
                .contains(&event.shard_index(self.total_shard_count))
    }

    pub fn has_work(&self) -> bool {
        self.processing_enabled && !self.shards.is_empty()
    }

    pub fn filter(&self) -> ShardFilter {
        ShardFilter::new(self.shards.clone(), self.total_shard_count)
    }

    /// Successor snapshot with the given ownership.
    pub fn next(&self, shards: BTreeSet<u32>, processing_enabled: bool) -> Self {
        Self {
            generation: self.generation + 1,
            total_shard_count: self.total_shard_count,
            shards,
            processing_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outbox_types::EntityChange;

    #[test]
    fn test_initial_owns_nothing() {
        let snapshot = AssignmentSnapshot::initial(4);
        let event = OutboxEvent::new(1, "t", "book", "1", EntityChange::Delete, Utc::now());
        assert!(!snapshot.owns(&event));
        assert!(!snapshot.has_work());
    }

    #[test]
    fn test_owns_by_shard() {
        let event = OutboxEvent::new(1, "t", "book", "1", EntityChange::Delete, Utc::now());
        let shard = event.shard_index(4);
        let snapshot = AssignmentSnapshot::initial(4).next([shard].into_iter().collect(), true);
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.owns(&event));

        let disabled = snapshot.next([shard].into_iter().collect(), false);
        assert!(!disabled.owns(&event));
    }
}
