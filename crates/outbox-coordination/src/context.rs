//! Collaborators handed to an agent.

use std::sync::Arc;

use outbox_indexing::IndexWriter;
use outbox_storage::{AgentStore, OutboxEventSource, TenantStorage};

/// Store and index handles owned by one agent for its whole life.
///
/// Each task receives clones of the handles it needs; nothing is reached
/// through globals.
#[derive(Clone)]
pub struct AgentContext {
    pub agents: Arc<dyn AgentStore>,
    pub outbox: Arc<dyn OutboxEventSource>,
    pub index: Arc<dyn IndexWriter>,
}

impl AgentContext {
    pub fn new(
        agents: Arc<dyn AgentStore>,
        outbox: Arc<dyn OutboxEventSource>,
        index: Arc<dyn IndexWriter>,
    ) -> Self {
        Self {
            agents,
            outbox,
            index,
        }
    }

    /// Context backed by one tenant of the RocksDB store.
    pub fn for_tenant(storage: TenantStorage, index: Arc<dyn IndexWriter>) -> Self {
        let shared = Arc::new(storage);
        Self {
            agents: shared.clone(),
            outbox: shared,
            index,
        }
    }
}
