//! The agent's own row.
//!
//! Only the owning process mutates its row. Every write goes through
//! [`AgentRow`], which serializes writers so a lease renewal never
//! overwrites a concurrent state change with a stale copy.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use outbox_storage::{AgentStore, StorageError};
use outbox_types::{Agent, AgentId, AgentState};

use crate::error::CoordinationError;

/// Outcome of a row write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWrite {
    /// The mutation changed nothing; no write was issued
    Unchanged,
    Updated(Agent),
    /// The row had been deleted by a peer and was registered again
    Recreated(Agent),
}

/// Locally cached copy of the agent's row plus its store.
pub struct AgentRow {
    store: Arc<dyn AgentStore>,
    record: Mutex<Agent>,
    id: AgentId,
    state_tx: watch::Sender<AgentState>,
}

impl AgentRow {
    pub fn new(store: Arc<dyn AgentStore>, agent: Agent) -> Self {
        let (state_tx, _) = watch::channel(agent.state);
        Self {
            store,
            id: agent.id,
            record: Mutex::new(agent),
            state_tx,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn store(&self) -> &Arc<dyn AgentStore> {
        &self.store
    }

    /// Last state written by this process.
    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    /// Copy of the cached row.
    pub async fn current(&self) -> Agent {
        self.record.lock().await.clone()
    }

    /// Insert the row. Fails with [`CoordinationError::Conflict`] if the id
    /// is taken.
    pub async fn register(&self) -> Result<(), CoordinationError> {
        let record = self.record.lock().await;
        let store = self.store.clone();
        let agent = record.clone();
        tokio::task::spawn_blocking(move || store.create(&agent))
            .await?
            .map_err(CoordinationError::from_registration)?;
        debug!(agent_id = %self.id, "Agent row created");
        Ok(())
    }

    /// Apply `mutate` to a copy of the row and persist it.
    ///
    /// `mutate` returns whether it changed anything. The cached row is
    /// replaced only after the store accepted the write. If a peer deleted
    /// the row, it is created again in STARTING with no shards, unless the
    /// mutation stopped the agent.
    pub async fn update<F>(&self, mutate: F) -> Result<RowWrite, CoordinationError>
    where
        F: FnOnce(&mut Agent) -> bool,
    {
        let mut record = self.record.lock().await;
        let mut next = record.clone();
        if !mutate(&mut next) {
            return Ok(RowWrite::Unchanged);
        }

        let store = self.store.clone();
        let row = next.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<RowWrite, StorageError> {
            match store.update(&row) {
                Ok(()) => Ok(RowWrite::Updated(row)),
                Err(StorageError::NotFound(_)) if !row.state.is_terminal() => {
                    let mut fresh = row;
                    fresh.state = AgentState::Starting;
                    fresh.assigned_shard_ids.clear();
                    store.create(&fresh)?;
                    Ok(RowWrite::Recreated(fresh))
                }
                Err(e) => Err(e),
            }
        })
        .await??;

        match &written {
            RowWrite::Updated(agent) => *record = agent.clone(),
            RowWrite::Recreated(agent) => {
                warn!(agent_id = %self.id, "Agent row was removed by a peer, registered again");
                *record = agent.clone();
            }
            RowWrite::Unchanged => {}
        }
        self.state_tx.send_if_modified(|state| {
            let changed = *state != record.state;
            *state = record.state;
            changed
        });
        Ok(written)
    }

    /// Move the cached row to STOPPED without touching the store.
    ///
    /// Used when the final write failed; the row is deleted next anyway.
    pub async fn mark_stopped_locally(&self) {
        let mut record = self.record.lock().await;
        record.state = AgentState::Stopped;
        record.assigned_shard_ids.clear();
        self.state_tx.send_replace(AgentState::Stopped);
    }

    /// Delete the row from the store.
    pub async fn deregister(&self) -> Result<(), CoordinationError> {
        let store = self.store.clone();
        let id = self.id;
        tokio::task::spawn_blocking(move || store.delete(&[id])).await??;
        debug!(agent_id = %self.id, "Agent row deleted");
        Ok(())
    }
}
