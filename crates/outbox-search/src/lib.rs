//! # outbox-search
//!
//! Secondary full-text index fed by outbox events, built on Tantivy.
//!
//! ## Features
//! - Embedded Tantivy index with MmapDirectory for persistence
//! - One document per entity, keyed on a stable document id
//! - Atomic change sets: a set of upserts/deletes commits together or not at all
//! - Lookup by document id for verification and diagnostics
//!
//! Upserts delete any previous document with the same id before adding the
//! new one, so applying the same change twice leaves the index unchanged.

pub mod document;
pub mod error;
pub mod index;
pub mod indexer;
pub mod reader;
pub mod schema;

pub use document::{DocumentChange, IndexedDocument};
pub use error::SearchError;
pub use index::{open_or_create_index, SearchIndex, SearchIndexConfig};
pub use indexer::DocumentIndexer;
pub use reader::DocumentReader;
pub use schema::{build_document_schema, SearchSchema};
