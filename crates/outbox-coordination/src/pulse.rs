//! Lease renewal.
//!
//! The [`PulseEmitter`] pushes the agent's expiration forward every pulse
//! interval. The [`LeaseClock`] is the agent's local view of that lease:
//! once it lapses, or the row had to be registered again, the agent counts
//! as possibly demoted until the monitor has recomputed its assignment from
//! a fresh snapshot.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use outbox_types::AgentState;

use crate::error::CoordinationError;
use crate::row::{AgentRow, RowWrite};

/// Local view of the agent's lease.
///
/// A fresh clock starts lapsed, so a new agent is demoted until its first
/// assignment has been computed.
#[derive(Debug, Default)]
pub struct LeaseClock {
    valid_until_ms: AtomicI64,
    lapse_noted: AtomicBool,
    demotions: AtomicU64,
    revalidated: AtomicU64,
}

impl LeaseClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.valid_until_ms.load(Ordering::SeqCst)
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.valid_until_ms.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Time left on the lease at `now`.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.valid_until() - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Count a demotion if the lease has lapsed at `now` and this lapse was
    /// not counted yet. Returns whether it counted one.
    pub fn note_lapse_if_expired(&self, now: DateTime<Utc>) -> bool {
        if self.is_valid_at(now) || self.lapse_noted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.mark_demoted();
        true
    }

    /// Record a successful renewal up to `expiration`.
    pub fn record_renewal(&self, now: DateTime<Utc>, expiration: DateTime<Utc>) {
        self.note_lapse_if_expired(now);
        self.valid_until_ms
            .store(expiration.timestamp_millis(), Ordering::SeqCst);
        self.lapse_noted.store(false, Ordering::SeqCst);
    }

    pub fn mark_demoted(&self) {
        self.demotions.fetch_add(1, Ordering::SeqCst);
    }

    /// Demotions counted so far; the monitor reads this before its snapshot.
    pub fn demotions(&self) -> u64 {
        self.demotions.load(Ordering::SeqCst)
    }

    /// Clear every demotion counted up to `observed`.
    pub fn mark_revalidated(&self, observed: u64) {
        self.revalidated.fetch_max(observed, Ordering::SeqCst);
    }

    pub fn is_demoted(&self) -> bool {
        self.demotions.load(Ordering::SeqCst) > self.revalidated.load(Ordering::SeqCst)
    }

    /// Whether the agent may process events at `now`.
    pub fn may_process_at(&self, now: DateTime<Utc>) -> bool {
        self.is_valid_at(now) && !self.is_demoted()
    }
}

/// Renews one agent row's lease.
pub struct PulseEmitter {
    row: Arc<AgentRow>,
    clock: Arc<LeaseClock>,
    lease: chrono::Duration,
    max_attempts: u32,
}

impl PulseEmitter {
    pub fn new(
        row: Arc<AgentRow>,
        clock: Arc<LeaseClock>,
        lease: chrono::Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            row,
            clock,
            lease,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Renew the lease once, retrying failed writes with exponential
    /// backoff. Gives up after `max_attempts` or once the remaining lease
    /// is spent, whichever comes first.
    ///
    /// The first successful pulse of a STARTING row moves it to RUNNING.
    pub async fn pulse(&self) -> Result<RowWrite, CoordinationError> {
        let remaining = self.clock.remaining_at(Utc::now());
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(remaining.max(Duration::from_millis(100))),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = Utc::now();
            let lease = self.lease;
            let result = self
                .row
                .update(|agent| {
                    agent.renew_lease(now, lease);
                    if agent.state == AgentState::Starting {
                        agent.state = AgentState::Running;
                    }
                    true
                })
                .await;

            match result {
                Ok(written) => {
                    match &written {
                        RowWrite::Updated(agent) => {
                            self.clock.record_renewal(now, agent.expiration);
                        }
                        RowWrite::Recreated(agent) => {
                            self.clock.record_renewal(now, agent.expiration);
                            self.clock.mark_demoted();
                        }
                        RowWrite::Unchanged => {}
                    }
                    debug!(agent_id = %self.row.id(), attempt, "Pulse written");
                    return Ok(written);
                }
                Err(e) => {
                    if self.clock.note_lapse_if_expired(Utc::now()) {
                        warn!(agent_id = %self.row.id(), "Lease lapsed, treating agent as demoted");
                    }
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                agent_id = %self.row.id(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Pulse failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }
}

/// Pulse every `interval` until `cancel` fires.
///
/// `on_promoted` is notified whenever a pulse moved the row to RUNNING or
/// registered it again, so the monitor can reassign without waiting.
pub(crate) async fn run_pulse_loop(
    name: String,
    emitter: PulseEmitter,
    interval: Duration,
    cancel: CancellationToken,
    on_promoted: Arc<Notify>,
) {
    info!(task = %name, "Pulse task started");
    loop {
        let before = emitter.row.state();
        match emitter.pulse().await {
            Ok(RowWrite::Recreated(_)) => on_promoted.notify_one(),
            Ok(_) => {
                if before == AgentState::Starting && emitter.row.state() == AgentState::Running {
                    info!(agent_id = %emitter.row.id(), "Agent running");
                    on_promoted.notify_one();
                }
            }
            Err(e) => {
                error!(task = %name, error = %e, "Pulse failed after bounded retries");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(task = %name, "Pulse task stopped");
}
