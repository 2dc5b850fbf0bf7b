//! Event dispatch for outbox synchronization.
//!
//! This crate turns outbox events into index operations and settles them.
//!
//! ## Key Components
//!
//! - [`IndexOperation`]: One entity-keyed change to the secondary index
//! - [`IndexWriter`]: Collaborator trait that applies operations
//! - [`SearchIndexWriter`]: Tantivy-backed writer
//! - [`translate`]: Event payload to operations
//! - [`EventDispatcher`]: Apply, acknowledge, or apply the retry policy
//! - [`DispatchReport`]: Per-batch accounting
//!
//! ## Flow
//!
//! 1. The poller hands a batch of fetched events to the dispatcher
//! 2. Each event still owned by the agent is translated and applied
//! 3. Success acknowledges the event; failure counts a retry
//! 4. An event out of retries moves to the poison store and stops blocking its shard

pub mod dispatcher;
pub mod error;
pub mod operation;
pub mod report;
pub mod search_writer;
pub mod translate;
pub mod writer;

pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use error::IndexingError;
pub use operation::IndexOperation;
pub use report::DispatchReport;
pub use search_writer::SearchIndexWriter;
pub use translate::{document_id, translate};
pub use writer::IndexWriter;
