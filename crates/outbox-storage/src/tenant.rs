//! Tenant-scoped view over [`Storage`].
//!
//! Every agent works for exactly one tenant. A [`TenantStorage`] pins the
//! tenant once and implements both store contracts on top of it, so the
//! coordination core never handles tenant ids itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outbox_types::{Agent, AgentId, EntityChange, OutboxEvent};

use crate::db::Storage;
use crate::error::StorageError;
use crate::keys::validate_tenant;
use crate::store::{AgentStore, FailureOutcome, OutboxEventSource, RetryPolicy, ShardFilter};

/// Storage handle bound to one tenant.
#[derive(Clone)]
pub struct TenantStorage {
    storage: Arc<Storage>,
    tenant: String,
}

impl TenantStorage {
    /// Bind `storage` to `tenant`. Tenant ids must be non-empty and free of `:`.
    pub fn new(storage: Arc<Storage>, tenant: &str) -> Result<Self, StorageError> {
        validate_tenant(tenant)?;
        Ok(Self {
            storage,
            tenant: tenant.to_string(),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The shared underlying storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Append an event for a change of `entity_name`/`entity_id`.
    pub fn append_event(
        &self,
        entity_name: &str,
        entity_id: &str,
        change: EntityChange,
    ) -> Result<OutboxEvent, StorageError> {
        self.storage
            .append_event(&self.tenant, entity_name, entity_id, change)
    }

    pub fn count_pending(&self) -> Result<u64, StorageError> {
        self.storage.count_pending(&self.tenant)
    }

    pub fn list_poisoned(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        self.storage.list_poisoned(&self.tenant, limit)
    }

    pub fn count_poisoned(&self) -> Result<u64, StorageError> {
        self.storage.count_poisoned(&self.tenant)
    }

    /// Requeue every poisoned event with a fresh retry budget.
    pub fn reprocess_poisoned(&self) -> Result<usize, StorageError> {
        self.storage.reprocess_poisoned(&self.tenant)
    }

    pub fn clear_poisoned(&self) -> Result<usize, StorageError> {
        self.storage.clear_poisoned(&self.tenant)
    }
}

impl AgentStore for TenantStorage {
    fn create(&self, agent: &Agent) -> Result<(), StorageError> {
        self.storage.create_agent(&self.tenant, agent)
    }

    fn find(&self, id: &AgentId) -> Result<Option<Agent>, StorageError> {
        self.storage.get_agent(&self.tenant, id)
    }

    fn list_all_ordered_by_id(&self) -> Result<Vec<Agent>, StorageError> {
        self.storage.list_agents(&self.tenant)
    }

    fn update(&self, agent: &Agent) -> Result<(), StorageError> {
        self.storage.update_agent(&self.tenant, agent)
    }

    fn delete(&self, ids: &[AgentId]) -> Result<(), StorageError> {
        self.storage.delete_agents(&self.tenant, ids)
    }
}

impl OutboxEventSource for TenantStorage {
    fn fetch_batch(
        &self,
        filter: &ShardFilter,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        self.storage
            .fetch_events(&self.tenant, filter, max_count, now)
    }

    fn acknowledge(&self, sequence: u64) -> Result<(), StorageError> {
        self.storage.acknowledge_event(&self.tenant, sequence)
    }

    fn record_failure(
        &self,
        sequence: u64,
        reason: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError> {
        self.storage
            .record_event_failure(&self.tenant, sequence, reason, policy, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_types::AgentType;
    use tempfile::TempDir;

    fn open(temp: &TempDir) -> Arc<Storage> {
        Arc::new(Storage::open(temp.path()).unwrap())
    }

    #[test]
    fn test_rejects_invalid_tenant() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);
        assert!(storage.for_tenant("").is_err());
        assert!(storage.for_tenant("a:b").is_err());
        assert_eq!(storage.for_tenant("acme").unwrap().tenant(), "acme");
    }

    #[test]
    fn test_agent_store_contract() {
        let temp = TempDir::new().unwrap();
        let store = open(&temp).for_tenant("acme").unwrap();
        let store: &dyn AgentStore = &store;

        let mut agent = Agent::new("w", AgentType::EventProcessing, "acme", Utc::now());
        store.create(&agent).unwrap();
        assert!(matches!(store.create(&agent), Err(StorageError::Conflict(_))));

        agent.name = "renamed".to_string();
        store.update(&agent).unwrap();
        assert_eq!(store.find(&agent.id).unwrap().unwrap().name, "renamed");
        assert_eq!(store.list_all_ordered_by_id().unwrap().len(), 1);

        store.delete(&[agent.id]).unwrap();
        store.delete(&[agent.id]).unwrap();
        assert!(store.find(&agent.id).unwrap().is_none());
        assert!(matches!(store.update(&agent), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_tenants_are_isolated() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);
        let acme = storage.for_tenant("acme").unwrap();
        let globex = storage.for_tenant("globex").unwrap();

        acme.create(&Agent::new("w", AgentType::EventProcessing, "acme", Utc::now()))
            .unwrap();
        acme.append_event("book", "1", EntityChange::Delete).unwrap();

        assert!(globex.list_all_ordered_by_id().unwrap().is_empty());
        assert_eq!(globex.count_pending().unwrap(), 0);
        assert_eq!(acme.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_event_source_contract() {
        let temp = TempDir::new().unwrap();
        let source = open(&temp).for_tenant("acme").unwrap();
        let event = source.append_event("book", "1", EntityChange::Delete).unwrap();

        let batch = source.fetch_batch(&ShardFilter::all(4), 10, Utc::now()).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sequence, event.sequence);
        assert_eq!(batch[0].entity_id, "1");

        source.acknowledge(event.sequence).unwrap();
        assert!(source
            .fetch_batch(&ShardFilter::all(4), 10, Utc::now())
            .unwrap()
            .is_empty());
    }
}
