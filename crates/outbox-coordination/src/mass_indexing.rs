//! Mass-indexing lease.
//!
//! A bulk reindex must not race incremental updates. While a lease is
//! held, a MASS_INDEXING agent row stays alive in the store and every event
//! processor of the tenant suspends itself at its next monitor cycle.
//! Releasing the lease deletes the row and the processors resume.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use outbox_storage::AgentStore;
use outbox_types::{Agent, AgentId, AgentType};

use crate::config::CoordinationConfig;
use crate::error::CoordinationError;
use crate::membership::{MembershipSnapshot, PeerStatus};
use crate::pulse::{run_pulse_loop, LeaseClock, PulseEmitter};
use crate::row::AgentRow;

/// A held mass-indexing lease.
pub struct MassIndexingLease {
    row: Arc<AgentRow>,
    agents: Arc<dyn AgentStore>,
    cancel: CancellationToken,
    pulse: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl MassIndexingLease {
    /// Register a MASS_INDEXING agent and start pulsing it.
    ///
    /// The first pulse happens before this returns, so the lease is
    /// visible to every processor's next monitor cycle.
    pub async fn acquire(
        config: &CoordinationConfig,
        agents: Arc<dyn AgentStore>,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;

        let agent = Agent::new(
            format!("{}-mass-indexing", config.agent_name),
            AgentType::MassIndexing,
            config.tenant_id.clone(),
            Utc::now(),
        );
        let row = Arc::new(AgentRow::new(agents.clone(), agent));
        row.register().await?;

        let emitter = PulseEmitter::new(
            row.clone(),
            Arc::new(LeaseClock::new()),
            config.lease(),
            config.pulse_max_attempts,
        );
        if let Err(e) = emitter.pulse().await {
            if let Err(cleanup) = row.deregister().await {
                warn!(agent_id = %row.id(), error = %cleanup, "Could not remove failed lease row");
            }
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let pulse = tokio::spawn(run_pulse_loop(
            config.task_name(&row.id(), "mass-indexing"),
            emitter,
            config.pulse_interval,
            cancel.clone(),
            Arc::new(Notify::new()),
        ));

        info!(agent_id = %row.id(), tenant = %config.tenant_id, "Mass indexing lease acquired");
        Ok(Self {
            row,
            agents,
            cancel,
            pulse: Some(pulse),
            poll_interval: config.poll_backoff_min.max(Duration::from_millis(10)),
        })
    }

    pub fn id(&self) -> AgentId {
        self.row.id()
    }

    /// Wait until no alive event processor is still RUNNING or STARTING.
    pub async fn wait_for_processors_suspended(
        &self,
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let store = self.agents.clone();
            let rows = tokio::task::spawn_blocking(move || store.list_all_ordered_by_id()).await??;
            let snapshot = MembershipSnapshot::new(rows, Utc::now());
            let active = snapshot
                .agents()
                .iter()
                .filter(|a| {
                    a.is_event_processor()
                        && matches!(
                            snapshot.status_of(a),
                            PeerStatus::Alive | PeerStatus::Starting
                        )
                })
                .count();

            if active == 0 {
                info!(agent_id = %self.id(), "All event processors suspended");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoordinationError::Timeout(format!(
                    "{} event processors still active after {:?}",
                    active, timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop pulsing and delete the lease row.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.cancel.cancel();
        if let Some(pulse) = self.pulse.take() {
            if let Err(e) = pulse.await {
                warn!(agent_id = %self.id(), error = %e, "Lease pulse ended abnormally");
            }
        }
        self.row.deregister().await?;
        info!(agent_id = %self.id(), "Mass indexing lease released");
        Ok(())
    }
}

impl Drop for MassIndexingLease {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(pulse) = self.pulse.take() {
            pulse.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_storage::Storage;
    use outbox_types::AgentState;
    use tempfile::TempDir;

    fn config() -> CoordinationConfig {
        CoordinationConfig::default()
            .with_tenant("acme")
            .with_lease(Duration::from_millis(50), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let store: Arc<dyn AgentStore> = Arc::new(storage.for_tenant("acme").unwrap());

        let lease = MassIndexingLease::acquire(&config(), store.clone()).await.unwrap();
        let row = store.find(&lease.id()).unwrap().unwrap();
        assert_eq!(row.agent_type, AgentType::MassIndexing);
        assert_eq!(row.state, AgentState::Running);

        let snapshot = MembershipSnapshot::new(store.list_all_ordered_by_id().unwrap(), Utc::now());
        assert!(snapshot.mass_indexing_active());
        assert!(snapshot.alive_processors().is_empty());

        // No processors at all: nothing to wait for.
        lease
            .wait_for_processors_suspended(Duration::from_millis(100))
            .await
            .unwrap();

        let id = lease.id();
        lease.release().await.unwrap();
        assert!(store.find(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_times_out_with_running_processor() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let store: Arc<dyn AgentStore> = Arc::new(storage.for_tenant("acme").unwrap());

        let mut processor = Agent::new("w", AgentType::EventProcessing, "acme", Utc::now());
        processor.state = AgentState::Running;
        processor.renew_lease(Utc::now(), chrono::Duration::seconds(60));
        store.create(&processor).unwrap();

        let lease = MassIndexingLease::acquire(&config(), store.clone()).await.unwrap();
        let result = lease
            .wait_for_processors_suspended(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CoordinationError::Timeout(_))));
        lease.release().await.unwrap();
    }
}
