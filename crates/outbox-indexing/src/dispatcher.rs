//! Event dispatcher.
//!
//! Settles each fetched event exactly one way: applied and acknowledged,
//! left pending with one more retry counted, moved to the poison store, or
//! skipped because the shard changed hands mid-batch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use outbox_storage::{FailureOutcome, OutboxEventSource, RetryPolicy};
use outbox_types::OutboxEvent;

use crate::error::IndexingError;
use crate::report::DispatchReport;
use crate::translate::translate;
use crate::writer::IndexWriter;

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    Retrying { attempt: u32 },
    Poisoned { attempts: u32 },
    Skipped,
}

/// Applies outbox events to an index writer and settles them in the source.
pub struct EventDispatcher {
    source: Arc<dyn OutboxEventSource>,
    writer: Arc<dyn IndexWriter>,
    policy: RetryPolicy,
}

impl EventDispatcher {
    pub fn new(
        source: Arc<dyn OutboxEventSource>,
        writer: Arc<dyn IndexWriter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            writer,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch a batch in order.
    ///
    /// `is_owned` is asked before each event; once it says no, the event is
    /// skipped and left pending for its new owner. An event left pending
    /// also skips the later events of the same entity in this batch, so an
    /// older document never lands on top of a newer one. Index failures
    /// never end the batch. Only a failure to settle an event in the source
    /// does.
    pub fn dispatch<F>(
        &self,
        events: &[OutboxEvent],
        is_owned: F,
    ) -> Result<DispatchReport, IndexingError>
    where
        F: Fn(&OutboxEvent) -> bool,
    {
        let mut report = DispatchReport::new();
        let mut held: HashSet<(&str, &str)> = HashSet::new();

        for event in events {
            let entity = (event.entity_name.as_str(), event.entity_id.as_str());
            if held.contains(&entity) {
                debug!(
                    sequence = event.sequence,
                    entity_id = %event.entity_id,
                    "Earlier event of entity still pending, skipping"
                );
                report.record_skipped();
                continue;
            }

            if !is_owned(event) {
                debug!(sequence = event.sequence, "Event no longer owned, skipping");
                report.record_skipped();
                held.insert(entity);
                continue;
            }

            match self.dispatch_one(event)? {
                DispatchOutcome::Applied => report.record_applied(event.sequence),
                DispatchOutcome::Retrying { .. } => {
                    report.record_retried();
                    held.insert(entity);
                }
                DispatchOutcome::Poisoned { .. } => report.record_poisoned(),
                DispatchOutcome::Skipped => report.record_skipped(),
            }
        }

        if report.has_updates() {
            info!(
                writer = %self.writer.name(),
                applied = report.applied,
                retried = report.retried,
                poisoned = report.poisoned,
                last_sequence = report.last_sequence,
                "Dispatched batch"
            );
        }
        Ok(report)
    }

    /// Apply one event and settle it.
    pub fn dispatch_one(&self, event: &OutboxEvent) -> Result<DispatchOutcome, IndexingError> {
        let applied = translate(event).and_then(|ops| self.writer.apply(&ops));

        match applied {
            Ok(()) => {
                self.source.acknowledge(event.sequence)?;
                debug!(sequence = event.sequence, entity_id = %event.entity_id, "Event applied");
                Ok(DispatchOutcome::Applied)
            }
            Err(e) => {
                let reason = e.to_string();
                let outcome =
                    self.source
                        .record_failure(event.sequence, &reason, &self.policy, Utc::now())?;
                match outcome {
                    FailureOutcome::Retry {
                        attempt,
                        process_after,
                    } => {
                        warn!(
                            sequence = event.sequence,
                            attempt,
                            %process_after,
                            error = %reason,
                            "Event failed, will retry"
                        );
                        Ok(DispatchOutcome::Retrying { attempt })
                    }
                    FailureOutcome::Poisoned { attempts } => {
                        warn!(
                            sequence = event.sequence,
                            entity_name = %event.entity_name,
                            entity_id = %event.entity_id,
                            attempts,
                            error = %reason,
                            "Event poisoned"
                        );
                        Ok(DispatchOutcome::Poisoned { attempts })
                    }
                    FailureOutcome::AlreadyProcessed => {
                        debug!(sequence = event.sequence, "Event settled elsewhere");
                        Ok(DispatchOutcome::Skipped)
                    }
                }
            }
        }
    }
}
