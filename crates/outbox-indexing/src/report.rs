//! Accounting of a dispatched batch.

use serde::{Deserialize, Serialize};

/// Counts of what happened to each event of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Events applied and acknowledged
    pub applied: usize,
    /// Events that failed and stay pending for another attempt
    pub retried: usize,
    /// Events moved to the poison store
    pub poisoned: usize,
    /// Events left pending or already settled elsewhere
    pub skipped: usize,
    /// Highest sequence that was applied
    pub last_sequence: u64,
}

impl DispatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&mut self, sequence: u64) {
        self.applied += 1;
        self.last_sequence = self.last_sequence.max(sequence);
    }

    pub fn record_retried(&mut self) {
        self.retried += 1;
    }

    pub fn record_poisoned(&mut self) {
        self.poisoned += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: &DispatchReport) {
        self.applied += other.applied;
        self.retried += other.retried;
        self.poisoned += other.poisoned;
        self.skipped += other.skipped;
        self.last_sequence = self.last_sequence.max(other.last_sequence);
    }

    /// Number of events accounted for.
    pub fn total(&self) -> usize {
        self.applied + self.retried + self.poisoned + self.skipped
    }

    /// Whether any event left the pending set.
    pub fn has_updates(&self) -> bool {
        self.applied > 0 || self.poisoned > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_total() {
        let mut report = DispatchReport::new();
        report.record_applied(7);
        report.record_applied(3);
        report.record_retried();
        report.record_skipped();

        assert_eq!(report.applied, 2);
        assert_eq!(report.last_sequence, 7);
        assert_eq!(report.total(), 4);
        assert!(report.has_updates());
    }

    #[test]
    fn test_merge() {
        let mut a = DispatchReport::new();
        a.record_applied(5);
        let mut b = DispatchReport::new();
        b.record_poisoned();
        b.record_applied(9);

        a.merge(&b);
        assert_eq!(a.applied, 2);
        assert_eq!(a.poisoned, 1);
        assert_eq!(a.last_sequence, 9);
    }

    #[test]
    fn test_retries_only_is_not_an_update() {
        let mut report = DispatchReport::new();
        report.record_retried();
        report.record_skipped();
        assert!(!report.has_updates());
    }
}
