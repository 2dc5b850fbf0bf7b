//! RocksDB wrapper for outbox synchronization storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Agent row CRUD scoped by tenant
//! - Event append with an atomically persisted sequence counter
//! - Fetch/acknowledge/failure bookkeeping and poison management
//!
//! Read-modify-write sequences (create, update, append, acknowledge,
//! failure recording, poison moves) run under one writer lock, so two
//! agents settling the same event never resurrect a deleted row.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info, warn};

use outbox_types::{Agent, AgentId, EntityChange, OutboxEvent};

use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_AGENTS, CF_META, CF_OUTBOX, CF_POISON,
};
use crate::error::StorageError;
use crate::keys::{validate_tenant, AgentKey, OutboxKey, OUTBOX_SEQUENCE_KEY};
use crate::store::{FailureOutcome, RetryPolicy, ShardFilter};
use crate::tenant::TenantStorage;

/// Main storage interface
pub struct Storage {
    db: DB,
    /// Next outbox sequence number
    outbox_sequence: AtomicU64,
    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let outbox_sequence = Self::load_outbox_sequence(&db)?;
        debug!(next_sequence = outbox_sequence, "Loaded outbox sequence");

        Ok(Self {
            db,
            outbox_sequence: AtomicU64::new(outbox_sequence),
            write_lock: Mutex::new(()),
        })
    }

    /// Scope this storage to one tenant.
    pub fn for_tenant(self: &Arc<Self>, tenant: &str) -> Result<TenantStorage, StorageError> {
        TenantStorage::new(Arc::clone(self), tenant)
    }

    /// Load the next outbox sequence number from the meta column family
    fn load_outbox_sequence(db: &DB) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_META.to_string()))?;

        match db.get_cf(&cf, OUTBOX_SEQUENCE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StorageError::Serialization(format!(
                        "outbox sequence has {} bytes, expected 8",
                        bytes.len()
                    ))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }

    /// Collect every (key, value) under a prefix of one column family
    fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key, value));
        }
        Ok(results)
    }

    fn count_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<u64, StorageError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut count = 0u64;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    // ==================== Agent Methods ====================

    /// Insert a new agent row; duplicate ids are a conflict.
    pub fn create_agent(&self, tenant: &str, agent: &Agent) -> Result<(), StorageError> {
        let cf = self.cf(CF_AGENTS)?;
        let key = AgentKey::new(tenant, agent.id).to_bytes();

        let _guard = self.lock()?;
        if self.db.get_cf(cf, &key)?.is_some() {
            return Err(StorageError::Conflict(format!(
                "agent {} already exists in tenant {}",
                agent.id, tenant
            )));
        }
        self.db.put_cf(cf, &key, agent.to_bytes()?)?;

        info!(
            tenant = %tenant,
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            "Registered agent"
        );
        Ok(())
    }

    /// Fetch an agent row by id
    pub fn get_agent(&self, tenant: &str, id: &AgentId) -> Result<Option<Agent>, StorageError> {
        let cf = self.cf(CF_AGENTS)?;
        let key = AgentKey::new(tenant, *id);
        match self.db.get_cf(cf, key.to_bytes())? {
            Some(bytes) => Ok(Some(Agent::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every agent row of a tenant, ordered by id
    pub fn list_agents(&self, tenant: &str) -> Result<Vec<Agent>, StorageError> {
        let rows = self.scan_prefix(CF_AGENTS, &AgentKey::tenant_prefix(tenant))?;
        rows.iter()
            .map(|(_, value)| Agent::from_bytes(value).map_err(StorageError::from))
            .collect()
    }

    /// Overwrite an existing agent row
    pub fn update_agent(&self, tenant: &str, agent: &Agent) -> Result<(), StorageError> {
        let cf = self.cf(CF_AGENTS)?;
        let key = AgentKey::new(tenant, agent.id).to_bytes();

        let _guard = self.lock()?;
        if self.db.get_cf(cf, &key)?.is_none() {
            return Err(StorageError::NotFound(format!("agent {}", agent.id)));
        }
        self.db.put_cf(cf, &key, agent.to_bytes()?)?;
        Ok(())
    }

    /// Delete agent rows; absent ids are ignored
    pub fn delete_agents(&self, tenant: &str, ids: &[AgentId]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_AGENTS)?;

        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(cf, AgentKey::new(tenant, *id).to_bytes());
        }
        self.db.write(batch)?;

        debug!(tenant = %tenant, count = ids.len(), "Deleted agent rows");
        Ok(())
    }

    // ==================== Outbox Methods ====================

    /// Append an event for an entity change.
    ///
    /// The event and the advanced sequence counter are written in one batch.
    pub fn append_event(
        &self,
        tenant: &str,
        entity_name: &str,
        entity_id: &str,
        change: EntityChange,
    ) -> Result<OutboxEvent, StorageError> {
        validate_tenant(tenant)?;
        let outbox_cf = self.cf(CF_OUTBOX)?;
        let meta_cf = self.cf(CF_META)?;

        let _guard = self.lock()?;
        let sequence = self.outbox_sequence.load(Ordering::SeqCst);
        let event = OutboxEvent::new(
            sequence,
            tenant,
            entity_name,
            entity_id,
            change,
            Utc::now(),
        );

        let mut batch = WriteBatch::default();
        batch.put_cf(
            outbox_cf,
            OutboxKey::new(tenant, sequence).to_bytes(),
            event.to_bytes()?,
        );
        batch.put_cf(meta_cf, OUTBOX_SEQUENCE_KEY, (sequence + 1).to_be_bytes());
        self.db.write(batch)?;
        self.outbox_sequence.store(sequence + 1, Ordering::SeqCst);

        debug!(
            tenant = %tenant,
            sequence,
            entity = %entity_name,
            entity_id = %entity_id,
            "Appended outbox event"
        );
        Ok(event)
    }

    /// Pending events matching `filter`, ascending by sequence.
    ///
    /// An event waiting out its retry delay holds back every later event of
    /// the same entity, so an entity's changes are applied in sequence order.
    ///
    /// Keys are ordered by sequence only, so every pending event of the
    /// tenant is read and decoded, including those of unowned shards.
    pub fn fetch_events(
        &self,
        tenant: &str,
        filter: &ShardFilter,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        if filter.is_empty() || max_count == 0 {
            return Ok(Vec::new());
        }

        let cf = self.cf(CF_OUTBOX)?;
        let prefix = OutboxKey::tenant_prefix(tenant);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut results = Vec::new();
        let mut waiting: HashSet<(String, String)> = HashSet::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let event = OutboxEvent::from_bytes(&value)?;
            if !filter.matches(&event) {
                continue;
            }
            let entity = (event.entity_name.clone(), event.entity_id.clone());
            if !event.is_due_at(now) {
                waiting.insert(entity);
            } else if !waiting.contains(&entity) {
                results.push(event);
                if results.len() >= max_count {
                    break;
                }
            }
        }

        Ok(results)
    }

    /// Remove a processed event; absent events are ignored
    pub fn acknowledge_event(&self, tenant: &str, sequence: u64) -> Result<(), StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let _guard = self.lock()?;
        self.db
            .delete_cf(cf, OutboxKey::new(tenant, sequence).to_bytes())?;
        debug!(tenant = %tenant, sequence, "Acknowledged outbox event");
        Ok(())
    }

    /// Count a failed attempt; poison the event once the budget is spent.
    pub fn record_event_failure(
        &self,
        tenant: &str,
        sequence: u64,
        reason: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError> {
        let outbox_cf = self.cf(CF_OUTBOX)?;
        let poison_cf = self.cf(CF_POISON)?;
        let key = OutboxKey::new(tenant, sequence).to_bytes();

        let _guard = self.lock()?;
        let Some(bytes) = self.db.get_cf(outbox_cf, &key)? else {
            debug!(tenant = %tenant, sequence, "Failure recorded for settled event");
            return Ok(FailureOutcome::AlreadyProcessed);
        };

        let mut event = OutboxEvent::from_bytes(&bytes)?;
        event.retries += 1;
        event.last_error = Some(reason.to_string());

        if policy.is_exhausted(event.retries) {
            event.process_after = None;
            let mut batch = WriteBatch::default();
            batch.delete_cf(outbox_cf, &key);
            batch.put_cf(poison_cf, &key, event.to_bytes()?);
            self.db.write(batch)?;

            warn!(
                tenant = %tenant,
                sequence,
                entity = %event.entity_name,
                entity_id = %event.entity_id,
                attempts = event.retries,
                reason = %reason,
                "Event poisoned after exhausting retries"
            );
            return Ok(FailureOutcome::Poisoned {
                attempts: event.retries,
            });
        }

        let process_after = delay_after(now, policy.retry_delay);
        event.process_after = Some(process_after);
        self.db.put_cf(outbox_cf, &key, event.to_bytes()?)?;

        Ok(FailureOutcome::Retry {
            attempt: event.retries,
            process_after,
        })
    }

    /// Number of pending events of a tenant
    pub fn count_pending(&self, tenant: &str) -> Result<u64, StorageError> {
        self.count_prefix(CF_OUTBOX, &OutboxKey::tenant_prefix(tenant))
    }

    // ==================== Poison Methods ====================

    /// Poisoned events of a tenant, ascending by sequence
    pub fn list_poisoned(&self, tenant: &str, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let cf = self.cf(CF_POISON)?;
        let prefix = OutboxKey::tenant_prefix(tenant);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut results = Vec::new();
        for item in iter.take(limit) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            results.push(OutboxEvent::from_bytes(&value)?);
        }
        Ok(results)
    }

    /// Number of poisoned events of a tenant
    pub fn count_poisoned(&self, tenant: &str) -> Result<u64, StorageError> {
        self.count_prefix(CF_POISON, &OutboxKey::tenant_prefix(tenant))
    }

    /// Move every poisoned event back to pending with a fresh retry budget.
    ///
    /// Returns the number of events moved.
    pub fn reprocess_poisoned(&self, tenant: &str) -> Result<usize, StorageError> {
        let outbox_cf = self.cf(CF_OUTBOX)?;
        let poison_cf = self.cf(CF_POISON)?;

        let _guard = self.lock()?;
        let rows = self.scan_prefix(CF_POISON, &OutboxKey::tenant_prefix(tenant))?;

        let mut batch = WriteBatch::default();
        for (key, value) in &rows {
            let mut event = OutboxEvent::from_bytes(value)?;
            event.retries = 0;
            event.process_after = None;
            batch.delete_cf(poison_cf, key);
            batch.put_cf(outbox_cf, key, event.to_bytes()?);
        }
        self.db.write(batch)?;

        info!(tenant = %tenant, count = rows.len(), "Requeued poisoned events");
        Ok(rows.len())
    }

    /// Drop every poisoned event of a tenant. Returns the number dropped.
    pub fn clear_poisoned(&self, tenant: &str) -> Result<usize, StorageError> {
        let poison_cf = self.cf(CF_POISON)?;

        let _guard = self.lock()?;
        let rows = self.scan_prefix(CF_POISON, &OutboxKey::tenant_prefix(tenant))?;

        let mut batch = WriteBatch::default();
        for (key, _) in &rows {
            batch.delete_cf(poison_cf, key);
        }
        self.db.write(batch)?;

        info!(tenant = %tenant, count = rows.len(), "Cleared poisoned events");
        Ok(rows.len())
    }

    // ===== Admin Operations =====

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }

    /// Trigger manual compaction on all column families.
    pub fn compact(&self) -> Result<(), StorageError> {
        info!("Starting full compaction...");
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.compact_range_cf::<&[u8], &[u8]>(&cf, None, None);
            }
        }
        info!("Compaction complete");
        Ok(())
    }

    /// Get database statistics across all tenants.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        if let Some(cf) = self.db.cf_handle(CF_AGENTS) {
            stats.agent_count = self.count_cf_entries(cf)?;
        }

        if let Some(cf) = self.db.cf_handle(CF_OUTBOX) {
            stats.pending_count = self.count_cf_entries(cf)?;
        }

        if let Some(cf) = self.db.cf_handle(CF_POISON) {
            stats.poisoned_count = self.count_cf_entries(cf)?;
        }

        stats.next_sequence = self.outbox_sequence.load(Ordering::SeqCst);
        stats.disk_usage_bytes = self.get_disk_usage()?;

        Ok(stats)
    }

    fn count_cf_entries(&self, cf: &rocksdb::ColumnFamily) -> Result<u64, StorageError> {
        let mut count = 0u64;
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn get_disk_usage(&self) -> Result<u64, StorageError> {
        let path = self.db.path();
        let mut total_size = 0u64;

        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }

        Ok(total_size)
    }
}

/// `now + delay`, saturating at the largest representable instant
fn delay_after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Number of agent rows
    pub agent_count: u64,
    /// Number of pending outbox events
    pub pending_count: u64,
    /// Number of poisoned events
    pub poisoned_count: u64,
    /// Sequence number the next appended event receives
    pub next_sequence: u64,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    use outbox_types::AgentType;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn upsert(title: &str) -> EntityChange {
        EntityChange::Upsert {
            document: json!({ "title": title }),
        }
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in ALL_CF_NAMES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[test]
    fn test_create_agent_conflict() {
        let (storage, _temp) = create_test_storage();
        let agent = Agent::new("a", AgentType::EventProcessing, "acme", Utc::now());

        storage.create_agent("acme", &agent).unwrap();
        let err = storage.create_agent("acme", &agent).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Same id in another tenant is a different row
        storage.create_agent("globex", &agent).unwrap();
    }

    #[test]
    fn test_list_agents_ordered_by_id() {
        let (storage, _temp) = create_test_storage();
        let now = Utc::now();

        let mut ids = Vec::new();
        for i in 0..5 {
            let agent = Agent::new(format!("a{}", i), AgentType::EventProcessing, "acme", now);
            ids.push(agent.id);
            storage.create_agent("acme", &agent).unwrap();
        }
        storage
            .create_agent("other", &Agent::new("x", AgentType::EventProcessing, "other", now))
            .unwrap();

        ids.sort();
        let listed: Vec<AgentId> = storage
            .list_agents("acme")
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_update_missing_agent_is_not_found() {
        let (storage, _temp) = create_test_storage();
        let agent = Agent::new("a", AgentType::EventProcessing, "acme", Utc::now());
        let err = storage.update_agent("acme", &agent).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_delete_agents_is_idempotent() {
        let (storage, _temp) = create_test_storage();
        let agent = Agent::new("a", AgentType::EventProcessing, "acme", Utc::now());
        storage.create_agent("acme", &agent).unwrap();

        storage.delete_agents("acme", &[agent.id]).unwrap();
        storage.delete_agents("acme", &[agent.id, AgentId::new()]).unwrap();
        assert!(storage.get_agent("acme", &agent.id).unwrap().is_none());
    }

    #[test]
    fn test_append_assigns_increasing_sequences() {
        let (storage, _temp) = create_test_storage();
        let e1 = storage.append_event("acme", "book", "1", upsert("a")).unwrap();
        let e2 = storage.append_event("acme", "book", "2", upsert("b")).unwrap();
        assert!(e2.sequence > e1.sequence);
        assert_eq!(storage.count_pending("acme").unwrap(), 2);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let last = {
            let storage = Storage::open(temp_dir.path()).unwrap();
            storage.append_event("acme", "book", "1", upsert("a")).unwrap();
            let e = storage.append_event("acme", "book", "2", upsert("b")).unwrap();
            // Acknowledged events must not let the counter go backwards
            storage.acknowledge_event("acme", e.sequence).unwrap();
            e.sequence
        };

        let storage = Storage::open(temp_dir.path()).unwrap();
        let next = storage.append_event("acme", "book", "3", upsert("c")).unwrap();
        assert_eq!(next.sequence, last + 1);
    }

    #[test]
    fn test_fetch_filters_by_shard_and_orders_by_sequence() {
        let (storage, _temp) = create_test_storage();
        for i in 0..40 {
            storage
                .append_event("acme", "book", &format!("book-{}", i), upsert("t"))
                .unwrap();
        }

        let filter = ShardFilter::new([1, 3].into_iter().collect(), 4);
        let events = storage.fetch_events("acme", &filter, 100, Utc::now()).unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| filter.matches(e)));
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let limited = storage.fetch_events("acme", &filter, 3, Utc::now()).unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[..], events[..3]);
    }

    #[test]
    fn test_fetch_is_tenant_scoped() {
        let (storage, _temp) = create_test_storage();
        storage.append_event("acme", "book", "1", upsert("a")).unwrap();
        let events = storage
            .fetch_events("globex", &ShardFilter::all(4), 10, Utc::now())
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_waiting_event_holds_back_same_entity() {
        let (storage, _temp) = create_test_storage();
        let policy = RetryPolicy::new(3, StdDuration::from_secs(60));
        let first = storage.append_event("acme", "book", "1", upsert("v1")).unwrap();
        let second = storage.append_event("acme", "book", "1", upsert("v2")).unwrap();
        let other = storage.append_event("acme", "book", "2", upsert("x")).unwrap();
        let now = Utc::now();

        storage
            .record_event_failure("acme", first.sequence, "boom", &policy, now)
            .unwrap();

        let filter = ShardFilter::all(1);
        let sequences: Vec<u64> = storage
            .fetch_events("acme", &filter, 10, now)
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![other.sequence]);
        assert_eq!(storage.count_pending("acme").unwrap(), 3);

        let later = now + Duration::seconds(61);
        let sequences: Vec<u64> = storage
            .fetch_events("acme", &filter, 10, later)
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![first.sequence, second.sequence, other.sequence]);
    }

    #[test]
    fn test_record_failure_retries_then_poisons() {
        let (storage, _temp) = create_test_storage();
        let policy = RetryPolicy::new(3, StdDuration::from_secs(60));
        let event = storage.append_event("acme", "book", "1", upsert("a")).unwrap();
        let now = Utc::now();

        for attempt in 1..3 {
            let outcome = storage
                .record_event_failure("acme", event.sequence, "boom", &policy, now)
                .unwrap();
            match outcome {
                FailureOutcome::Retry {
                    attempt: a,
                    process_after,
                } => {
                    assert_eq!(a, attempt);
                    assert!(process_after > now);
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }

        // Not due before the retry delay elapses
        let filter = ShardFilter::all(4);
        assert!(storage.fetch_events("acme", &filter, 10, now).unwrap().is_empty());
        let later = now + Duration::seconds(61);
        assert_eq!(storage.fetch_events("acme", &filter, 10, later).unwrap().len(), 1);

        let outcome = storage
            .record_event_failure("acme", event.sequence, "boom", &policy, now)
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Poisoned { attempts: 3 });
        assert!(storage.fetch_events("acme", &filter, 10, later).unwrap().is_empty());

        let poisoned = storage.list_poisoned("acme", 10).unwrap();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].retries, 3);
        assert_eq!(poisoned[0].last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_failure_after_acknowledge_is_already_processed() {
        let (storage, _temp) = create_test_storage();
        let event = storage.append_event("acme", "book", "1", upsert("a")).unwrap();
        storage.acknowledge_event("acme", event.sequence).unwrap();
        storage.acknowledge_event("acme", event.sequence).unwrap();

        let outcome = storage
            .record_event_failure("acme", event.sequence, "late", &RetryPolicy::default(), Utc::now())
            .unwrap();
        assert_eq!(outcome, FailureOutcome::AlreadyProcessed);
        assert_eq!(storage.count_pending("acme").unwrap(), 0);
    }

    #[test]
    fn test_reprocess_and_clear_poisoned() {
        let (storage, _temp) = create_test_storage();
        let policy = RetryPolicy::new(1, StdDuration::from_secs(1));
        for i in 0..3 {
            let e = storage
                .append_event("acme", "book", &i.to_string(), upsert("x"))
                .unwrap();
            storage
                .record_event_failure("acme", e.sequence, "bad", &policy, Utc::now())
                .unwrap();
        }
        assert_eq!(storage.count_poisoned("acme").unwrap(), 3);
        assert_eq!(storage.count_pending("acme").unwrap(), 0);

        assert_eq!(storage.reprocess_poisoned("acme").unwrap(), 3);
        assert_eq!(storage.count_poisoned("acme").unwrap(), 0);
        let pending = storage
            .fetch_events("acme", &ShardFilter::all(2), 10, Utc::now())
            .unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|e| e.retries == 0));

        for e in &pending {
            storage
                .record_event_failure("acme", e.sequence, "bad", &policy, Utc::now())
                .unwrap();
        }
        assert_eq!(storage.clear_poisoned("acme").unwrap(), 3);
        assert_eq!(storage.count_poisoned("acme").unwrap(), 0);
    }

    #[test]
    fn test_get_stats() {
        let (storage, _temp) = create_test_storage();
        storage
            .create_agent("acme", &Agent::new("a", AgentType::EventProcessing, "acme", Utc::now()))
            .unwrap();
        storage.append_event("acme", "book", "1", upsert("a")).unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.agent_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.poisoned_count, 0);
        assert_eq!(stats.next_sequence, 1);
    }

    #[test]
    fn test_append_rejects_invalid_tenant() {
        let (storage, _temp) = create_test_storage();
        let err = storage.append_event("a:b", "book", "1", upsert("a")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidTenant(_)));
    }
}
