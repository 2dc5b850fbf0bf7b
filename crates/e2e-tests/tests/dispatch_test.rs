//! Event dispatch E2E tests.
//!
//! Drives the dispatcher cycle by cycle against the real RocksDB outbox:
//! retry budgets, poisoning, and repeated application of the same events
//! against the real Tantivy index.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;

use e2e_tests::{entity_id_for_shard, FlakyWriter, TestHarness};
use outbox_indexing::{
    document_id, DispatchReport, EventDispatcher, IndexOperation, IndexWriter, IndexingError,
};
use outbox_storage::{OutboxEventSource, RetryPolicy, ShardFilter};
use outbox_types::EntityChange;

const TOTAL: u32 = 4;

fn dispatcher(harness: &TestHarness, writer: Arc<dyn IndexWriter>, max_retries: u32) -> EventDispatcher {
    EventDispatcher::new(
        Arc::new(harness.tenant.clone()),
        writer,
        RetryPolicy::new(max_retries, Duration::ZERO),
    )
}

/// One poller cycle over `shards`: fetch, then dispatch everything fetched.
fn cycle(harness: &TestHarness, dispatcher: &EventDispatcher, shards: &[u32]) -> DispatchReport {
    let filter = ShardFilter::new(shards.iter().copied().collect(), TOTAL);
    let batch = harness
        .tenant
        .fetch_batch(&filter, 10, Utc::now())
        .unwrap();
    dispatcher.dispatch(&batch, |e| filter.matches(e)).unwrap()
}

/// An event on shard 2 that fails three times with a budget of three is
/// poisoned and never delivered again.
#[test]
fn test_failing_event_is_poisoned_after_budget() {
    let harness = TestHarness::new();
    let writer = Arc::new(FlakyWriter::new());
    let id = entity_id_for_shard(2, TOTAL);
    writer.fail_for(document_id("book", &id));

    let event = harness
        .tenant
        .append_event("book", &id, EntityChange::Delete)
        .unwrap();
    assert_eq!(event.retries, 0);
    assert_eq!(event.shard_index(TOTAL), 2);

    let dispatcher = dispatcher(&harness, writer.clone(), 3);

    let first = cycle(&harness, &dispatcher, &[2]);
    assert_eq!(first.retried, 1);
    let second = cycle(&harness, &dispatcher, &[2]);
    assert_eq!(second.retried, 1);
    let third = cycle(&harness, &dispatcher, &[2]);
    assert_eq!(third.poisoned, 1);

    let fourth = cycle(&harness, &dispatcher, &[2]);
    assert_eq!(fourth.total(), 0);
    assert_eq!(writer.attempts(), 3);

    assert_eq!(harness.tenant.count_pending().unwrap(), 0);
    let poisoned = harness.tenant.list_poisoned(10).unwrap();
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].sequence, event.sequence);
    assert_eq!(poisoned[0].retries, 3);
    assert!(poisoned[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("injected failure"));
}

/// A failing event does not hold back later events of the same shard.
#[test]
fn test_failure_does_not_block_shard() {
    let harness = TestHarness::new();
    let writer = Arc::new(FlakyWriter::new());
    let bad = entity_id_for_shard(2, TOTAL);
    writer.fail_for(document_id("book", &bad));

    harness.upsert_book(&bad, "Bad");
    let good = (0..10_000)
        .map(|n| format!("other-{}", n))
        .find(|id| outbox_types::shard_key_for(id) % TOTAL == 2)
        .unwrap();
    harness.upsert_book(&good, "Good");

    let dispatcher = dispatcher(&harness, writer.clone(), 3);
    let report = cycle(&harness, &dispatcher, &[2]);
    assert_eq!(report.applied, 1);
    assert_eq!(report.retried, 1);

    let applied: Vec<String> = writer
        .applied()
        .iter()
        .map(|op| op.document_id().to_string())
        .collect();
    assert_eq!(applied, vec![document_id("book", &good)]);
}

/// Real index writer whose first write fails.
struct FailFirstWrite {
    inner: Arc<dyn IndexWriter>,
    failed: AtomicBool,
}

impl IndexWriter for FailFirstWrite {
    fn apply(&self, operations: &[IndexOperation]) -> Result<(), IndexingError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(IndexingError::Index("first write fails".to_string()));
        }
        self.inner.apply(operations)
    }

    fn name(&self) -> &str {
        "fail-first"
    }
}

/// A retried upsert never overwrites a newer upsert of the same entity.
#[test]
fn test_retry_keeps_newest_document() {
    let harness = TestHarness::new();
    let id = entity_id_for_shard(0, TOTAL);
    harness.upsert_book(&id, "v1");
    harness.upsert_book(&id, "v2");

    let writer = Arc::new(FailFirstWrite {
        inner: harness.writer.clone(),
        failed: AtomicBool::new(false),
    });
    let dispatcher = dispatcher(&harness, writer, 3);

    let first = cycle(&harness, &dispatcher, &[0]);
    assert_eq!(first.retried, 1);
    assert_eq!(first.applied, 0);
    assert!(harness.indexed_titles().is_empty());

    let second = cycle(&harness, &dispatcher, &[0]);
    assert_eq!(second.applied, 2);
    let third = cycle(&harness, &dispatcher, &[0]);
    assert_eq!(third.total(), 0);

    assert_eq!(harness.tenant.count_pending().unwrap(), 0);
    assert_eq!(
        harness.indexed_titles(),
        vec![(document_id("book", &id), "v2".to_string())]
    );
}

/// Requeued poison events get a fresh budget and apply once the index
/// recovers.
#[test]
fn test_reprocess_poisoned_after_recovery() {
    let harness = TestHarness::new();
    let writer = Arc::new(FlakyWriter::new());
    let id = entity_id_for_shard(1, TOTAL);
    writer.fail_for(document_id("book", &id));
    harness.upsert_book(&id, "Dune");

    let dispatcher = dispatcher(&harness, writer.clone(), 1);
    assert_eq!(cycle(&harness, &dispatcher, &[1]).poisoned, 1);
    assert_eq!(harness.tenant.count_poisoned().unwrap(), 1);

    writer.clear_failures();
    assert_eq!(harness.tenant.reprocess_poisoned().unwrap(), 1);
    assert_eq!(harness.tenant.count_poisoned().unwrap(), 0);

    let report = cycle(&harness, &dispatcher, &[1]);
    assert_eq!(report.applied, 1);
    assert_eq!(harness.tenant.count_pending().unwrap(), 0);
}

/// Malformed events are poisoned like any other failure.
#[test]
fn test_malformed_event_is_poisoned() {
    let harness = TestHarness::new();
    let id = entity_id_for_shard(0, TOTAL);
    harness
        .tenant
        .append_event(
            "book",
            &id,
            EntityChange::Upsert {
                document: serde_json::json!("just a string"),
            },
        )
        .unwrap();

    let dispatcher = dispatcher(&harness, harness.writer.clone(), 1);
    let report = cycle(&harness, &dispatcher, &[0]);
    assert_eq!(report.poisoned, 1);
    assert!(harness.indexed_titles().is_empty());
}

fn enqueue_shard_one_history(harness: &TestHarness) {
    let first = entity_id_for_shard(1, TOTAL);
    let second = (0..10_000)
        .map(|n| format!("novel-{}", n))
        .find(|id| outbox_types::shard_key_for(id) % TOTAL == 1)
        .unwrap();

    harness.upsert_book(&first, "Dune");
    harness.upsert_book(&second, "Emma");
    harness.upsert_book(&first, "Dune Messiah");
    harness
        .tenant
        .append_event("book", &second, EntityChange::Delete)
        .unwrap();
    harness.upsert_book(&second, "Emma (2nd ed.)");
}

/// Two agents that both believe they own shard 1 apply the same events;
/// the index ends up as if each event had been applied once.
#[test]
fn test_dual_application_matches_single_application() {
    let single = TestHarness::new();
    enqueue_shard_one_history(&single);
    let once = dispatcher(&single, single.writer.clone(), 3);
    assert_eq!(cycle(&single, &once, &[1]).applied, 5);
    let expected = single.indexed_titles();
    assert_eq!(expected.len(), 2);

    let dual = TestHarness::new();
    enqueue_shard_one_history(&dual);
    let old_owner = dispatcher(&dual, dual.writer.clone(), 3);
    let new_owner = dispatcher(&dual, dual.writer.clone(), 3);

    // Both fetch before either acknowledges.
    let filter = ShardFilter::new(BTreeSet::from([1]), TOTAL);
    let seen_by_old = dual.tenant.fetch_batch(&filter, 10, Utc::now()).unwrap();
    let seen_by_new = dual.tenant.fetch_batch(&filter, 10, Utc::now()).unwrap();
    assert_eq!(seen_by_old, seen_by_new);

    let old_report = old_owner.dispatch(&seen_by_old, |_| true).unwrap();
    let new_report = new_owner.dispatch(&seen_by_new, |_| true).unwrap();
    assert_eq!(old_report.applied, 5);
    assert_eq!(new_report.applied, 5);

    assert_eq!(dual.tenant.count_pending().unwrap(), 0);
    assert_eq!(dual.indexed_titles(), expected);
}

/// A late failure report for an event another agent already settled
/// leaves the outbox untouched.
#[test]
fn test_failure_after_settlement_is_skipped() {
    let harness = TestHarness::new();
    let id = entity_id_for_shard(3, TOTAL);
    harness.upsert_book(&id, "Dune");

    let filter = ShardFilter::new(BTreeSet::from([3]), TOTAL);
    let batch = harness.tenant.fetch_batch(&filter, 10, Utc::now()).unwrap();

    let healthy = dispatcher(&harness, harness.writer.clone(), 3);
    assert_eq!(healthy.dispatch(&batch, |_| true).unwrap().applied, 1);

    let writer = Arc::new(FlakyWriter::new());
    writer.fail_for(document_id("book", &id));
    let failing = dispatcher(&harness, writer, 3);
    let report = failing.dispatch(&batch, |_| true).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(harness.tenant.count_pending().unwrap(), 0);
    assert_eq!(harness.tenant.count_poisoned().unwrap(), 0);
}
