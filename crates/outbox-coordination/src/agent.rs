//! The coordination loop of one event-processing agent.
//!
//! An [`OutboxAgent`] owns three tasks:
//!
//! - **pulse**: renews the lease; the first success moves STARTING to RUNNING
//! - **monitor**: reads one membership snapshot per cycle, reconciles the
//!   agent state, recomputes and publishes the assignment, and deletes
//!   peers that stayed expired past the grace period
//! - **poller**: fetches and dispatches events of the published shards
//!
//! The tasks share nothing mutable except the published assignment, which
//! is replaced whole, and the agent row, whose writes are serialized.
//!
//! Graceful shutdown stops the poller first, then writes STOPPED, stops
//! the pulse and monitor, and finally deletes the row.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outbox_indexing::{DispatchReport, EventDispatcher};
use outbox_storage::AgentStore;
use outbox_types::{Agent, AgentId, AgentState, AgentType};

use crate::assignment::compute_assignment;
use crate::config::CoordinationConfig;
use crate::context::AgentContext;
use crate::error::CoordinationError;
use crate::membership::{MembershipMonitor, MembershipSnapshot};
use crate::poller::{IdleBackoff, OutboxPoller};
use crate::pulse::{run_pulse_loop, LeaseClock, PulseEmitter};
use crate::row::{AgentRow, RowWrite};
use crate::state::AssignmentSnapshot;

/// State shared between the agent handle and its tasks.
struct Shared {
    row: Arc<AgentRow>,
    clock: Arc<LeaseClock>,
    admin_suspended: AtomicBool,
    mass_indexing_active: AtomicBool,
    assignment_tx: watch::Sender<Arc<AssignmentSnapshot>>,
    revalidate: Arc<Notify>,
    totals: Arc<Mutex<DispatchReport>>,
}

impl Shared {
    fn id(&self) -> AgentId {
        self.row.id()
    }

    /// Publish new ownership if it differs from the current snapshot.
    fn publish(&self, shards: BTreeSet<u32>, enabled: bool) -> Option<Arc<AssignmentSnapshot>> {
        let mut published = None;
        self.assignment_tx.send_if_modified(|current| {
            if current.shards == shards && current.processing_enabled == enabled {
                return false;
            }
            let next = Arc::new(current.next(shards, enabled));
            *current = next.clone();
            published = Some(next);
            true
        });
        published
    }

    /// Move between RUNNING and SUSPENDED according to the pause flags.
    ///
    /// Administrative suspension wins over mass-indexing resumption.
    async fn reconcile_state(&self) -> Result<(), CoordinationError> {
        let desired = if self.admin_suspended.load(Ordering::SeqCst)
            || self.mass_indexing_active.load(Ordering::SeqCst)
        {
            AgentState::Suspended
        } else {
            AgentState::Running
        };

        let before = self.row.state();
        let written = self
            .row
            .update(|agent| match agent.state {
                AgentState::Running | AgentState::Suspended if agent.state != desired => {
                    agent.state = desired;
                    true
                }
                _ => false,
            })
            .await?;

        if let RowWrite::Updated(agent) = written {
            info!(agent_id = %self.id(), from = %before, to = %agent.state, "Agent state changed");
        }
        Ok(())
    }
}

struct AgentTasks {
    poller_cancel: CancellationToken,
    background_cancel: CancellationToken,
    poller: JoinHandle<()>,
    pulse: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl AgentTasks {
    fn abort(&self) {
        self.poller_cancel.cancel();
        self.background_cancel.cancel();
        self.poller.abort();
        self.pulse.abort();
        self.monitor.abort();
    }
}

/// One event-processing agent.
pub struct OutboxAgent {
    config: Arc<CoordinationConfig>,
    context: AgentContext,
    shared: Arc<Shared>,
    tasks: Option<AgentTasks>,
}

impl OutboxAgent {
    /// Create an agent. Nothing is written until [`OutboxAgent::start`].
    pub fn new(config: CoordinationConfig, context: AgentContext) -> Result<Self, CoordinationError> {
        config.validate()?;

        let agent = Agent::new(
            config.agent_name.clone(),
            AgentType::EventProcessing,
            config.tenant_id.clone(),
            Utc::now(),
        )
        .with_total_shard_count(config.total_shard_count);
        let (assignment_tx, _) =
            watch::channel(Arc::new(AssignmentSnapshot::initial(config.total_shard_count)));

        let shared = Arc::new(Shared {
            row: Arc::new(AgentRow::new(context.agents.clone(), agent)),
            clock: Arc::new(LeaseClock::new()),
            admin_suspended: AtomicBool::new(false),
            mass_indexing_active: AtomicBool::new(false),
            assignment_tx,
            revalidate: Arc::new(Notify::new()),
            totals: Arc::new(Mutex::new(DispatchReport::new())),
        });

        Ok(Self {
            config: Arc::new(config),
            context,
            shared,
            tasks: None,
        })
    }

    pub fn id(&self) -> AgentId {
        self.shared.id()
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        self.shared.row.state()
    }

    pub fn is_started(&self) -> bool {
        self.tasks.is_some()
    }

    /// Currently published assignment.
    pub fn assignment(&self) -> Arc<AssignmentSnapshot> {
        self.shared.assignment_tx.borrow().clone()
    }

    pub fn assigned_shards(&self) -> BTreeSet<u32> {
        self.assignment().shards.clone()
    }

    pub fn subscribe_assignment(&self) -> watch::Receiver<Arc<AssignmentSnapshot>> {
        self.shared.assignment_tx.subscribe()
    }

    /// Events settled by this agent since it started.
    pub fn dispatch_totals(&self) -> DispatchReport {
        self.shared
            .totals
            .lock()
            .map(|totals| totals.clone())
            .unwrap_or_default()
    }

    /// Register the agent row and start the pulse, monitor and poller.
    ///
    /// Returns once the row exists; the agent turns RUNNING with its first
    /// successful pulse. A duplicate id fails with
    /// [`CoordinationError::Conflict`].
    pub async fn start(&mut self) -> Result<(), CoordinationError> {
        if self.tasks.is_some() {
            return Err(CoordinationError::AlreadyStarted);
        }
        let state = self.state();
        if state != AgentState::Starting {
            return Err(CoordinationError::InvalidTransition {
                from: state,
                to: AgentState::Running,
            });
        }

        self.shared.row.register().await?;
        info!(
            agent_id = %self.id(),
            name = %self.config.agent_name,
            tenant = %self.config.tenant_id,
            total_shard_count = self.config.total_shard_count,
            strategy = ?self.config.assignment_strategy,
            "Agent registered"
        );

        let poller_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();

        let emitter = PulseEmitter::new(
            self.shared.row.clone(),
            self.shared.clock.clone(),
            self.config.lease(),
            self.config.pulse_max_attempts,
        );
        let pulse = tokio::spawn(run_pulse_loop(
            self.config.task_name(&self.id(), "pulse"),
            emitter,
            self.config.pulse_interval,
            background_cancel.clone(),
            self.shared.revalidate.clone(),
        ));

        let monitor = tokio::spawn(run_monitor(
            self.config.task_name(&self.id(), "monitor"),
            self.shared.clone(),
            self.config.clone(),
            self.context.agents.clone(),
            background_cancel.clone(),
        ));

        let dispatcher = Arc::new(EventDispatcher::new(
            self.context.outbox.clone(),
            self.context.index.clone(),
            self.config.retry_policy(),
        ));
        let poller = OutboxPoller::new(
            self.config.task_name(&self.id(), "poller"),
            self.context.outbox.clone(),
            dispatcher,
            self.shared.row.clone(),
            self.shared.clock.clone(),
            self.shared.assignment_tx.subscribe(),
            self.shared.revalidate.clone(),
            self.shared.totals.clone(),
            self.config.batch_size,
            IdleBackoff::new(
                self.config.poll_backoff_min,
                self.config.poll_backoff_max,
                self.config.poll_jitter,
            ),
        );
        let poller = tokio::spawn(poller.run(poller_cancel.clone()));

        self.tasks = Some(AgentTasks {
            poller_cancel,
            background_cancel,
            poller,
            pulse,
            monitor,
        });
        Ok(())
    }

    /// Wait until the agent reaches `state`.
    pub async fn wait_for_state(
        &self,
        state: AgentState,
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        let mut states = self.shared.row.subscribe_state();
        match tokio::time::timeout(timeout, states.wait_for(|s| *s == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CoordinationError::NotStarted),
            Err(_) => Err(CoordinationError::Timeout(format!(
                "agent {} did not reach {} within {:?}",
                self.id(),
                state,
                timeout
            ))),
        }
    }

    /// Administrative pause: stop polling, keep pulsing.
    ///
    /// Stays in effect until [`OutboxAgent::resume`], even if a mass
    /// indexer comes and goes meanwhile.
    pub async fn suspend(&self) -> Result<(), CoordinationError> {
        let state = self.state();
        if !matches!(state, AgentState::Running | AgentState::Suspended) {
            return Err(CoordinationError::InvalidTransition {
                from: state,
                to: AgentState::Suspended,
            });
        }
        self.shared.admin_suspended.store(true, Ordering::SeqCst);
        self.shared.reconcile_state().await
    }

    /// Lift an administrative pause. The agent stays SUSPENDED while a mass
    /// indexer is active.
    pub async fn resume(&self) -> Result<(), CoordinationError> {
        let state = self.state();
        if !matches!(state, AgentState::Running | AgentState::Suspended) {
            return Err(CoordinationError::InvalidTransition {
                from: state,
                to: AgentState::Running,
            });
        }
        self.shared.admin_suspended.store(false, Ordering::SeqCst);
        self.shared.reconcile_state().await
    }

    /// Graceful shutdown.
    pub async fn stop(&mut self) -> Result<(), CoordinationError> {
        let Some(tasks) = self.tasks.take() else {
            return Err(CoordinationError::NotStarted);
        };
        let id = self.id();
        info!(agent_id = %id, "Stopping agent");

        tasks.poller_cancel.cancel();
        if let Err(e) = tasks.poller.await {
            warn!(agent_id = %id, error = %e, "Poller ended abnormally");
        }
        self.shared.publish(BTreeSet::new(), false);

        let stopped = self
            .shared
            .row
            .update(|agent| {
                if agent.state.is_terminal() {
                    return false;
                }
                agent.state = AgentState::Stopped;
                agent.assigned_shard_ids.clear();
                true
            })
            .await;
        if let Err(e) = stopped {
            warn!(agent_id = %id, error = %e, "Could not record STOPPED, deregistering anyway");
            self.shared.row.mark_stopped_locally().await;
        }

        tasks.background_cancel.cancel();
        let (pulse, monitor) = tokio::join!(tasks.pulse, tasks.monitor);
        for (task, result) in [("pulse", pulse), ("monitor", monitor)] {
            if let Err(e) = result {
                warn!(agent_id = %id, task, error = %e, "Task ended abnormally");
            }
        }

        self.shared.row.deregister().await?;
        info!(agent_id = %id, "Agent stopped");
        Ok(())
    }

    /// Abort all tasks without touching the agent row, as a crash would.
    /// Peers take over once the lease lapses.
    pub fn kill(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.abort();
            warn!(agent_id = %self.id(), "Agent killed");
        }
    }
}

impl Drop for OutboxAgent {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.abort();
        }
    }
}

async fn run_monitor(
    name: String,
    shared: Arc<Shared>,
    config: Arc<CoordinationConfig>,
    agents: Arc<dyn AgentStore>,
    cancel: CancellationToken,
) {
    info!(task = %name, "Monitor started");
    let mut monitor =
        MembershipMonitor::new(shared.id(), config.total_shard_count, config.grace());

    loop {
        if let Err(e) = monitor_cycle(&shared, &config, &agents, &mut monitor).await {
            warn!(task = %name, error = %e, "Monitor cycle failed");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.monitor_interval) => {}
            _ = shared.revalidate.notified() => {}
        }
    }
    info!(task = %name, "Monitor stopped");
}

async fn monitor_cycle(
    shared: &Shared,
    config: &CoordinationConfig,
    agents: &Arc<dyn AgentStore>,
    monitor: &mut MembershipMonitor,
) -> Result<(), CoordinationError> {
    let demotions = shared.clock.demotions();
    let store = agents.clone();
    let rows = tokio::task::spawn_blocking(move || store.list_all_ordered_by_id()).await??;
    let snapshot = MembershipSnapshot::new(rows, Utc::now());
    let report = monitor.observe(&snapshot);

    shared
        .mass_indexing_active
        .store(report.mass_indexing_active, Ordering::SeqCst);
    shared.reconcile_state().await?;

    let enabled = report.shard_count_consistent();
    let shards = if enabled {
        compute_assignment(
            config.assignment_strategy,
            &report.alive_processors,
            config.total_shard_count,
        )
        .shards_for(&shared.id())
    } else {
        BTreeSet::new()
    };

    if let Some(published) = shared.publish(shards.clone(), enabled) {
        info!(
            agent_id = %shared.id(),
            generation = published.generation,
            shards = ?published.shards,
            alive = report.alive_processors.len(),
            processing_enabled = enabled,
            "Shard assignment changed"
        );
    }
    shared
        .row
        .update(|agent| {
            if agent.state.is_terminal() || agent.assigned_shard_ids == shards {
                return false;
            }
            agent.assigned_shard_ids = shards;
            true
        })
        .await?;
    shared.clock.mark_revalidated(demotions);

    for id in report.cleanup {
        if remove_if_expired(agents, id).await? {
            info!(agent_id = %id, observer = %shared.id(), "Removed expired agent row");
        }
        monitor.forget(&id);
    }
    Ok(())
}

/// Delete `id` if its row is still expired when re-read.
async fn remove_if_expired(
    agents: &Arc<dyn AgentStore>,
    id: AgentId,
) -> Result<bool, CoordinationError> {
    let store = agents.clone();
    let removed = tokio::task::spawn_blocking(move || {
        match store.find(&id)? {
            Some(row) if !row.is_alive_at(Utc::now()) => {
                store.delete(&[id])?;
                Ok(true)
            }
            Some(_) => {
                debug!(agent_id = %id, "Expired agent renewed its lease, keeping row");
                Ok(false)
            }
            None => Ok(false),
        }
    })
    .await??;
    Ok(removed)
}
