//! End-to-end test infrastructure for the outbox sync system.
//!
//! Provides a shared TestHarness wiring a real RocksDB store and a real
//! Tantivy index, plus helpers for driving agents through scenarios.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outbox_coordination::{AgentContext, CoordinationConfig, OutboxAgent};
use outbox_indexing::{IndexOperation, IndexWriter, IndexingError, SearchIndexWriter};
use outbox_search::{DocumentIndexer, DocumentReader, SearchIndex, SearchIndexConfig};
use outbox_storage::{Storage, TenantStorage};
use outbox_types::{shard_key_for, EntityChange};

/// Tenant used by every harness.
pub const TENANT: &str = "acme";

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub tenant: TenantStorage,
    pub index: SearchIndex,
    pub writer: Arc<SearchIndexWriter>,
    pub reader: DocumentReader,
}

impl TestHarness {
    /// Create a harness with a fresh store and index in a temp directory.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage = Arc::new(
            Storage::open(&temp_dir.path().join("db")).expect("Failed to open test storage"),
        );
        let tenant = storage.for_tenant(TENANT).expect("Failed to bind tenant");

        let index = SearchIndex::open_or_create(SearchIndexConfig::new(
            temp_dir.path().join("search-index"),
        ))
        .expect("Failed to open search index");
        let indexer = Arc::new(DocumentIndexer::new(&index).expect("Failed to open writer"));
        let writer = Arc::new(SearchIndexWriter::new(indexer));
        let reader = DocumentReader::new(&index).expect("Failed to open reader");

        Self {
            _temp_dir: temp_dir,
            storage,
            tenant,
            index,
            writer,
            reader,
        }
    }

    /// Context writing to the harness's real search index.
    pub fn context(&self) -> AgentContext {
        AgentContext::for_tenant(self.tenant.clone(), self.writer.clone())
    }

    /// Context writing through a custom index writer.
    pub fn context_with(&self, writer: Arc<dyn IndexWriter>) -> AgentContext {
        AgentContext::for_tenant(self.tenant.clone(), writer)
    }

    /// Create and start an agent; waits until it is RUNNING.
    pub async fn start_agent(&self, config: CoordinationConfig) -> OutboxAgent {
        let mut agent = OutboxAgent::new(config, self.context()).expect("Invalid agent config");
        agent.start().await.expect("Failed to start agent");
        agent
            .wait_for_state(outbox_types::AgentState::Running, Duration::from_secs(5))
            .await
            .expect("Agent never reached RUNNING");
        agent
    }

    /// Append an upsert of `{"title": title}` for `book:<id>`.
    pub fn upsert_book(&self, id: &str, title: &str) -> u64 {
        self.tenant
            .append_event(
                "book",
                id,
                EntityChange::Upsert {
                    document: serde_json::json!({ "title": title }),
                },
            )
            .expect("Failed to append event")
            .sequence
    }

    /// Wait until the tenant's outbox holds no pending events.
    pub async fn wait_for_drained(&self, timeout: Duration) {
        wait_until(timeout, || {
            self.tenant.count_pending().expect("Failed to count pending") == 0
        })
        .await;
    }

    /// Titles of all indexed books, keyed by document id.
    pub fn indexed_titles(&self) -> Vec<(String, String)> {
        self.reader.reload().expect("Failed to reload reader");
        self.reader
            .all_documents()
            .expect("Failed to read documents")
            .into_iter()
            .map(|doc| {
                let title = doc.fields["title"].as_str().unwrap_or_default().to_string();
                (doc.doc_id, title)
            })
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Short leases and quick polling so scenarios run in well under a second.
pub fn fast_config(total_shard_count: u32) -> CoordinationConfig {
    CoordinationConfig::default()
        .with_tenant(TENANT)
        .with_lease(Duration::from_millis(50), Duration::from_millis(400))
        .with_monitor_interval(Duration::from_millis(50))
        .with_poll_backoff(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .with_retries(3, Duration::from_millis(20))
        .with_expired_agent_grace(Duration::from_millis(100))
        .with_total_shard_count(total_shard_count)
}

/// Poll `condition` until it holds; panics after `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met before timeout");
}

/// Await `future`, panicking after `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("Timed out")
}

/// First `book-<n>` id whose shard under `total` is `shard`.
pub fn entity_id_for_shard(shard: u32, total: u32) -> String {
    (0..10_000)
        .map(|n| format!("book-{}", n))
        .find(|id| shard_key_for(id) % total == shard)
        .expect("No id hashes to shard")
}

/// Shards that more than one agent claims.
pub fn overlapping_shards(sets: &[BTreeSet<u32>]) -> BTreeSet<u32> {
    let mut seen = BTreeSet::new();
    let mut overlap = BTreeSet::new();
    for set in sets {
        for shard in set {
            if !seen.insert(*shard) {
                overlap.insert(*shard);
            }
        }
    }
    overlap
}

/// Index writer that records operations and fails for chosen documents.
#[derive(Default)]
pub struct FlakyWriter {
    failing_ids: Mutex<BTreeSet<String>>,
    attempts: AtomicUsize,
    applied: Mutex<Vec<IndexOperation>>,
}

impl FlakyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `document_id` fail.
    pub fn fail_for(&self, document_id: impl Into<String>) {
        self.failing_ids
            .lock()
            .expect("lock poisoned")
            .insert(document_id.into());
    }

    /// Let every write succeed again.
    pub fn clear_failures(&self) {
        self.failing_ids.lock().expect("lock poisoned").clear();
    }

    /// Number of `apply` calls, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<IndexOperation> {
        self.applied.lock().expect("lock poisoned").clone()
    }
}

impl IndexWriter for FlakyWriter {
    fn apply(&self, operations: &[IndexOperation]) -> Result<(), IndexingError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_ids.lock().expect("lock poisoned");
        if let Some(op) = operations
            .iter()
            .find(|op| failing.contains(op.document_id()))
        {
            return Err(IndexingError::Index(format!(
                "injected failure for {}",
                op.document_id()
            )));
        }
        self.applied
            .lock()
            .expect("lock poisoned")
            .extend_from_slice(operations);
        Ok(())
    }

    fn name(&self) -> &str {
        "flaky"
    }
}
