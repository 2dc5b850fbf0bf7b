//! Outbox polling.
//!
//! One batch is fetched and fully settled before the next fetch, so the
//! poller never holds two unacknowledged batches at once. Before each
//! batch it re-reads the published assignment and its lease; before each
//! event the dispatcher asks again whether the shard is still owned.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outbox_indexing::{DispatchReport, EventDispatcher};
use outbox_storage::OutboxEventSource;
use outbox_types::AgentState;

use crate::error::CoordinationError;
use crate::pulse::LeaseClock;
use crate::row::AgentRow;
use crate::state::AssignmentSnapshot;

/// Growing sleep between empty polls.
///
/// Doubles from `min` up to `max`; each delay gets a random extra of up to
/// `jitter` so idle agents do not poll in lockstep.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    current: Option<Duration>,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter,
            current: None,
        }
    }

    /// Delay before the next poll, without jitter.
    pub fn next_base(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Delay before the next poll, jitter included.
    pub fn next_delay(&mut self) -> Duration {
        self.next_base() + self.generate_jitter()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    fn generate_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not running, demoted, or owning no shard
    NotReady,
    /// Owned shards have no due events
    Idle,
    Dispatched(DispatchReport),
}

/// Fetches events of the owned shards and dispatches them.
pub struct OutboxPoller {
    name: String,
    source: Arc<dyn OutboxEventSource>,
    dispatcher: Arc<EventDispatcher>,
    row: Arc<AgentRow>,
    clock: Arc<LeaseClock>,
    assignment: watch::Receiver<Arc<AssignmentSnapshot>>,
    revalidate: Arc<Notify>,
    totals: Arc<Mutex<DispatchReport>>,
    batch_size: usize,
    idle: IdleBackoff,
}

impl OutboxPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        source: Arc<dyn OutboxEventSource>,
        dispatcher: Arc<EventDispatcher>,
        row: Arc<AgentRow>,
        clock: Arc<LeaseClock>,
        assignment: watch::Receiver<Arc<AssignmentSnapshot>>,
        revalidate: Arc<Notify>,
        totals: Arc<Mutex<DispatchReport>>,
        batch_size: usize,
        idle: IdleBackoff,
    ) -> Self {
        Self {
            name,
            source,
            dispatcher,
            row,
            clock,
            assignment,
            revalidate,
            totals,
            batch_size,
            idle,
        }
    }

    /// Fetch and dispatch at most one batch.
    ///
    /// Events left over when `cancel` fires stay pending.
    pub async fn poll_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, CoordinationError> {
        let snapshot = self.assignment.borrow_and_update().clone();
        if self.row.state() != AgentState::Running || !snapshot.has_work() {
            return Ok(PollOutcome::NotReady);
        }

        let now = Utc::now();
        if self.clock.note_lapse_if_expired(now) {
            warn!(task = %self.name, "Lease lapsed, pausing until assignment is revalidated");
        }
        if !self.clock.may_process_at(now) {
            self.revalidate.notify_one();
            return Ok(PollOutcome::NotReady);
        }

        let source = self.source.clone();
        let filter = snapshot.filter();
        let batch_size = self.batch_size;
        let events =
            tokio::task::spawn_blocking(move || source.fetch_batch(&filter, batch_size, now))
                .await??;
        if events.is_empty() {
            return Ok(PollOutcome::Idle);
        }
        debug!(
            task = %self.name,
            generation = snapshot.generation,
            count = events.len(),
            "Fetched batch"
        );

        let dispatcher = self.dispatcher.clone();
        let assignment = self.assignment.clone();
        let row = self.row.clone();
        let clock = self.clock.clone();
        let cancel = cancel.clone();
        let report = tokio::task::spawn_blocking(move || {
            dispatcher.dispatch(&events, |event| {
                !cancel.is_cancelled()
                    && row.state() == AgentState::Running
                    && clock.may_process_at(Utc::now())
                    && assignment.borrow().owns(event)
            })
        })
        .await??;

        if let Ok(mut totals) = self.totals.lock() {
            totals.merge(&report);
        }
        Ok(PollOutcome::Dispatched(report))
    }

    /// Poll until `cancel` fires.
    ///
    /// Store failures are logged and the cycle is retried after the idle
    /// backoff; a cycle is never dropped silently.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(task = %self.name, "Poller started");
        let mut assignment_changes = self.assignment.clone();
        let mut state_changes = self.row.subscribe_state();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delay = match self.poll_once(&cancel).await {
                Ok(PollOutcome::Dispatched(_)) => {
                    self.idle.reset();
                    continue;
                }
                Ok(PollOutcome::Idle) | Ok(PollOutcome::NotReady) => self.idle.next_delay(),
                Err(e) => {
                    warn!(task = %self.name, error = %e, "Poll cycle failed");
                    self.idle.next_delay()
                }
            };

            let woken = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => false,
                Ok(()) = assignment_changes.changed() => true,
                Ok(()) = state_changes.changed() => true,
            };
            if woken {
                self.idle.reset();
            }
        }
        info!(task = %self.name, "Poller stopped");
    }
}
