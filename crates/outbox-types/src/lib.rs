//! # outbox-types
//!
//! Shared domain types for the outbox synchronization system.
//!
//! This crate defines the data structures every other crate speaks:
//! - Agents: coordination participants with a liveness lease
//! - Outbox events: durable change records consumed by agents
//! - Shard hashing: the stable entity-to-shard mapping
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use outbox_types::{Agent, AgentType, OutboxEvent};
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod hash;
pub mod outbox;

pub use agent::{Agent, AgentId, AgentState, AgentType};
pub use config::{AssignmentStrategy, CoordinationSettings, Settings};
pub use error::OutboxError;
pub use hash::{fnv1a_32, fnv1a_64, shard_key_for};
pub use outbox::{EntityChange, OutboxEvent};
