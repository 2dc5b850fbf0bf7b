//! Agent coordination for outbox synchronization.
//!
//! Every process that consumes the outbox runs one or more agents. Agents
//! never talk to each other; they coordinate through the agent store alone:
//!
//! - [`PulseEmitter`] keeps the agent's lease in the future
//! - [`MembershipMonitor`] classifies peers and detects topology changes
//! - [`compute_assignment`] turns the alive set into a shard partition that
//!   every agent computes identically
//! - [`OutboxPoller`] fetches events of the owned shards and hands them to
//!   the event dispatcher
//! - [`OutboxAgent`] runs the three loops and drives the agent state machine
//! - [`MassIndexingLease`] pauses event processing during bulk reindexing
//!
//! Brief dual ownership of a shard during a rebalance is tolerated because
//! applying an event is idempotent.

pub mod agent;
pub mod assignment;
pub mod config;
pub mod context;
pub mod error;
pub mod mass_indexing;
pub mod membership;
pub mod poller;
pub mod pulse;
pub mod row;
pub mod state;

pub use agent::OutboxAgent;
pub use assignment::{compute_assignment, ShardAssignment};
pub use config::CoordinationConfig;
pub use context::AgentContext;
pub use error::CoordinationError;
pub use mass_indexing::MassIndexingLease;
pub use membership::{
    classify, MembershipMonitor, MembershipReport, MembershipSnapshot, PeerStatus, TopologyChange,
};
pub use poller::{IdleBackoff, OutboxPoller};
pub use pulse::{LeaseClock, PulseEmitter};
pub use row::{AgentRow, RowWrite};
pub use state::AssignmentSnapshot;
