//! Storage layer for outbox synchronization.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for agents, pending events and poisoned events
//! - Tenant-prefixed keys so one database can serve several tenants
//! - Atomic writes via WriteBatch (event + sequence counter)
//! - The [`AgentStore`] and [`OutboxEventSource`] contracts consumed by
//!   the coordination core, implemented by [`TenantStorage`]

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;
pub mod store;
pub mod tenant;

pub use db::{Storage, StorageStats};
pub use error::StorageError;
pub use keys::{AgentKey, OutboxKey};
pub use store::{AgentStore, FailureOutcome, OutboxEventSource, RetryPolicy, ShardFilter};
pub use tenant::TenantStorage;
