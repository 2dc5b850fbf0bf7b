//! Column family definitions for RocksDB.
//!
//! Each column family isolates data with different access patterns:
//! - agents: Agent rows, rewritten on every pulse (default compaction)
//! - outbox: Pending events in sequence order (compressed)
//! - poison: Events that exhausted their retry budget
//! - meta: Counters that must survive restarts

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for agent rows
pub const CF_AGENTS: &str = "agents";

/// Column family name for pending outbox events
pub const CF_OUTBOX: &str = "outbox";

/// Column family name for poisoned events
pub const CF_POISON: &str = "poison";

/// Column family name for persistent counters
pub const CF_META: &str = "meta";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_AGENTS, CF_OUTBOX, CF_POISON, CF_META];

/// Create column family options for event rows.
///
/// Rows must survive until acknowledged, so no FIFO compaction here.
fn outbox_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_AGENTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_OUTBOX, outbox_options()),
        ColumnFamilyDescriptor::new(CF_POISON, outbox_options()),
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
    ]
}
