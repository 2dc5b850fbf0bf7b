//! Membership monitoring.
//!
//! Each cycle reads every agent row once into an immutable
//! [`MembershipSnapshot`]. The [`MembershipMonitor`] compares it with what
//! it saw before and reports topology changes, which drive reassignment.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use outbox_types::{Agent, AgentId, AgentState, AgentType};

/// Liveness class of one agent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Lease valid and RUNNING
    Alive,
    Starting,
    Suspended,
    Stopped,
    /// Lease lapsed, whatever the recorded state
    Expired,
}

/// Classify `agent` at `now`.
pub fn classify(agent: &Agent, now: DateTime<Utc>) -> PeerStatus {
    if !agent.is_alive_at(now) {
        return PeerStatus::Expired;
    }
    match agent.state {
        AgentState::Running => PeerStatus::Alive,
        AgentState::Starting => PeerStatus::Starting,
        AgentState::Suspended => PeerStatus::Suspended,
        AgentState::Stopped => PeerStatus::Stopped,
    }
}

/// One consistent read of all agent rows of a tenant.
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    agents: Vec<Agent>,
    taken_at: DateTime<Utc>,
}

impl MembershipSnapshot {
    pub fn new(mut agents: Vec<Agent>, taken_at: DateTime<Utc>) -> Self {
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Self { agents, taken_at }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents
            .binary_search_by(|a| a.id.cmp(id))
            .ok()
            .map(|i| &self.agents[i])
    }

    pub fn status_of(&self, agent: &Agent) -> PeerStatus {
        classify(agent, self.taken_at)
    }

    /// Ids of alive event processors, ascending. This is the assignment input.
    pub fn alive_processors(&self) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|a| a.is_event_processor() && self.status_of(a) == PeerStatus::Alive)
            .map(|a| a.id)
            .collect()
    }

    /// Whether an alive mass indexer exists.
    pub fn mass_indexing_active(&self) -> bool {
        self.agents.iter().any(|a| {
            a.agent_type == AgentType::MassIndexing && self.status_of(a) == PeerStatus::Alive
        })
    }

    pub fn expired(&self) -> impl Iterator<Item = &Agent> {
        self.agents
            .iter()
            .filter(|a| self.status_of(a) == PeerStatus::Expired)
    }
}

/// A change in cluster topology since the previous observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    /// An event processor became alive
    Joined(AgentId),
    /// A previously alive event processor is no longer alive
    Left(AgentId),
    /// An alive event processor works with a different shard count
    ShardCountMismatch {
        agent: AgentId,
        expected: u32,
        found: Option<u32>,
    },
}

/// Result of one monitor cycle.
#[derive(Debug, Clone, Default)]
pub struct MembershipReport {
    pub changes: Vec<TopologyChange>,
    /// Assignment input, ascending by id
    pub alive_processors: Vec<AgentId>,
    pub mass_indexing_active: bool,
    /// Expired peers past their grace period; safe to delete
    pub cleanup: Vec<AgentId>,
}

impl MembershipReport {
    pub fn rebalance_required(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Whether all alive processors agree on the shard count.
    pub fn shard_count_consistent(&self) -> bool {
        !self
            .changes
            .iter()
            .any(|c| matches!(c, TopologyChange::ShardCountMismatch { .. }))
    }
}

/// Tracks membership across cycles for one agent.
pub struct MembershipMonitor {
    self_id: AgentId,
    total_shard_count: u32,
    grace: chrono::Duration,
    known_alive: BTreeSet<AgentId>,
    expired_since: BTreeMap<AgentId, DateTime<Utc>>,
}

impl MembershipMonitor {
    pub fn new(self_id: AgentId, total_shard_count: u32, grace: chrono::Duration) -> Self {
        Self {
            self_id,
            total_shard_count,
            grace,
            known_alive: BTreeSet::new(),
            expired_since: BTreeMap::new(),
        }
    }

    /// Compare `snapshot` with the previous cycle.
    ///
    /// An expired peer is reported for cleanup only after it stayed expired
    /// for the whole grace period. The monitor's own row is never reported.
    pub fn observe(&mut self, snapshot: &MembershipSnapshot) -> MembershipReport {
        let now = snapshot.taken_at();
        let alive = snapshot.alive_processors();
        let alive_set: BTreeSet<AgentId> = alive.iter().copied().collect();

        let mut changes = Vec::new();
        for id in alive_set.difference(&self.known_alive) {
            info!(agent_id = %id, observer = %self.self_id, "Agent joined");
            changes.push(TopologyChange::Joined(*id));
        }
        for id in self.known_alive.difference(&alive_set) {
            info!(agent_id = %id, observer = %self.self_id, "Agent left");
            changes.push(TopologyChange::Left(*id));
        }

        for id in &alive {
            let found = snapshot.get(id).and_then(|a| a.total_shard_count);
            if found != Some(self.total_shard_count) {
                warn!(
                    agent_id = %id,
                    expected = self.total_shard_count,
                    found = ?found,
                    "Shard count mismatch"
                );
                changes.push(TopologyChange::ShardCountMismatch {
                    agent: *id,
                    expected: self.total_shard_count,
                    found,
                });
            }
        }

        let expired_now: BTreeSet<AgentId> = snapshot
            .expired()
            .map(|a| a.id)
            .filter(|id| *id != self.self_id)
            .collect();
        self.expired_since.retain(|id, _| expired_now.contains(id));
        let mut cleanup = Vec::new();
        for id in &expired_now {
            let since = *self.expired_since.entry(*id).or_insert(now);
            if now - since >= self.grace {
                cleanup.push(*id);
            }
        }

        self.known_alive = alive_set;

        let report = MembershipReport {
            changes,
            alive_processors: alive,
            mass_indexing_active: snapshot.mass_indexing_active(),
            cleanup,
        };
        debug!(
            observer = %self.self_id,
            alive = report.alive_processors.len(),
            changes = report.changes.len(),
            cleanup = report.cleanup.len(),
            "Observed membership"
        );
        report
    }

    /// Forget a peer whose row was deleted.
    pub fn forget(&mut self, id: &AgentId) {
        self.expired_since.remove(id);
    }
}
