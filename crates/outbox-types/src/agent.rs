//! Agent records for cluster coordination.
//!
//! An agent is one running coordination participant. Its row in the agent
//! store is the only evidence other processes have that it is alive, so the
//! row carries a lease (`expiration`) that the owner keeps renewing.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::OutboxError;

/// Globally unique agent identifier.
///
/// Backed by a ULID so the canonical string form sorts in creation order.
/// Ordering by id is what makes membership snapshots totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(Ulid);

impl AgentId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Wrap an existing ULID.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// The underlying ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ulid>()
            .map(Self)
            .map_err(|e| OutboxError::InvalidInput(format!("invalid agent id {}: {}", s, e)))
    }
}

impl TryFrom<String> for AgentId {
    type Error = OutboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.to_string()
    }
}

/// Role of an agent in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Consumes outbox events for its assigned shards
    EventProcessing,
    /// Bulk reindexing job; event processors pause while one is alive
    MassIndexing,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentType::EventProcessing => write!(f, "event_processing"),
            AgentType::MassIndexing => write!(f, "mass_indexing"),
        }
    }
}

/// Lifecycle state of an agent.
///
/// ```text
/// STARTING -> RUNNING <-> SUSPENDED
///     |          |            |
///     +----------+------------+--> STOPPED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered, waiting for the first successful pulse
    Starting,
    /// Pulsing and (for event processors) polling its shards
    Running,
    /// Pulsing but not polling
    Suspended,
    /// Gracefully shut down
    Stopped,
}

impl AgentState {
    /// Whether this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Stopped)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is not a transition.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Stopped)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Stopped)
                | (Suspended, Stopped)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Starting => write!(f, "starting"),
            AgentState::Running => write!(f, "running"),
            AgentState::Suspended => write!(f, "suspended"),
            AgentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A row representing one running coordination participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Immutable identifier assigned at creation
    pub id: AgentId,

    /// Human-readable label, diagnostics only
    pub name: String,

    pub agent_type: AgentType,

    pub state: AgentState,

    /// Tenant this agent works for
    pub tenant_id: String,

    /// The agent is alive iff `now < expiration`
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiration: DateTime<Utc>,

    /// Last successful lease renewal
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_pulse: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Shard-space cardinality this agent believes is in effect.
    /// `None` for agents that do not take part in assignment.
    #[serde(default)]
    pub total_shard_count: Option<u32>,

    /// Shards this agent currently owns. Derived, not authoritative.
    #[serde(default)]
    pub assigned_shard_ids: BTreeSet<u32>,
}

impl Agent {
    /// Create a new agent row in STARTING state.
    ///
    /// The initial expiration equals `now`, so the row is not considered
    /// alive until its first pulse.
    pub fn new(
        name: impl Into<String>,
        agent_type: AgentType,
        tenant_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            agent_type,
            state: AgentState::Starting,
            tenant_id: tenant_id.into(),
            expiration: now,
            last_pulse: now,
            created_at: now,
            total_shard_count: None,
            assigned_shard_ids: BTreeSet::new(),
        }
    }

    /// Set the shard-space cardinality.
    pub fn with_total_shard_count(mut self, total: u32) -> Self {
        self.total_shard_count = Some(total);
        self
    }

    /// Use a specific identifier.
    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    /// Whether the lease is still valid at `now`.
    pub fn is_alive_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiration
    }

    /// Push the lease forward to `now + lease`.
    pub fn renew_lease(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.last_pulse = now;
        self.expiration = now + lease;
    }

    /// Whether this agent takes part in shard assignment.
    pub fn is_event_processor(&self) -> bool {
        self.agent_type == AgentType::EventProcessing
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_ordering_matches_string_ordering() {
        let a = AgentId::from_ulid(Ulid::from_parts(1_000, 7));
        let b = AgentId::from_ulid(Ulid::from_parts(2_000, 1));
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_agent_id_parse() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        use AgentState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Suspended.can_transition_to(Stopped));

        assert!(!Starting.can_transition_to(Suspended));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Running));
        assert!(Stopped.is_terminal());
        assert!(!Suspended.is_terminal());
    }

    #[test]
    fn test_lease() {
        let now = Utc::now();
        let mut agent = Agent::new("worker", AgentType::EventProcessing, "acme", now);
        assert!(!agent.is_alive_at(now));

        agent.renew_lease(now, Duration::seconds(30));
        assert!(agent.is_alive_at(now + Duration::seconds(29)));
        assert!(!agent.is_alive_at(now + Duration::seconds(30)));
        assert_eq!(agent.last_pulse, now);
    }

    #[test]
    fn test_agent_bytes() {
        let agent = Agent::new("worker", AgentType::MassIndexing, "acme", Utc::now())
            .with_total_shard_count(8);
        let decoded = Agent::from_bytes(&agent.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.id, agent.id);
        assert_eq!(decoded.agent_type, AgentType::MassIndexing);
        assert_eq!(decoded.total_shard_count, Some(8));
        assert_eq!(decoded.state, AgentState::Starting);
    }
}
