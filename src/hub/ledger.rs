//! Coalescing ledger for drop accounting
//!
//! Under sustained backpressure a slow client can miss thousands of events
//! per second. Rather than writing one row per miss, the hub records misses
//! here keyed by (client, topic, reason) and persists the merged runs on a
//! short timer.

use std::collections::HashMap;

use crate::types::DropReason;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DropKey {
    pub client_id: String,
    pub topic: String,
    pub reason: DropReason,
}

/// A run of missed events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropRun {
    pub count: i64,
    pub first_seq: i64,
    pub last_seq: i64,
}

impl DropRun {
    pub fn new(seq: i64) -> Self {
        Self {
            count: 1,
            first_seq: seq,
            last_seq: seq,
        }
    }

    pub fn extend(&mut self, seq: i64) {
        self.count += 1;
        self.first_seq = self.first_seq.min(seq);
        self.last_seq = self.last_seq.max(seq);
    }
}

#[derive(Debug)]
pub struct DropLedger {
    pending: HashMap<DropKey, DropRun>,
    /// Distinct keys held before the hub should flush early
    max_keys: usize,
}

impl DropLedger {
    pub fn new(max_keys: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_keys: max_keys.max(1),
        }
    }

    /// Account one missed event. Returns `true` when the ledger is large
    /// enough that it should be drained now.
    pub fn record(&mut self, client_id: &str, topic: &str, reason: DropReason, seq: i64) -> bool {
        let key = DropKey {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
            reason,
        };
        self.pending
            .entry(key)
            .and_modify(|run| run.extend(seq))
            .or_insert_with(|| DropRun::new(seq));
        self.pending.len() >= self.max_keys
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Take every pending run, oldest first
    pub fn drain(&mut self) -> Vec<(DropKey, DropRun)> {
        let mut runs: Vec<_> = self.pending.drain().collect();
        runs.sort_by_key(|(_, run)| run.first_seq);
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesces_per_key() {
        let mut ledger = DropLedger::new(100);
        for seq in [4, 5, 9] {
            ledger.record("c1", "panes:a:0", DropReason::BufferFull, seq);
        }
        ledger.record("c1", "sessions:a", DropReason::BufferFull, 6);
        ledger.record("c2", "panes:a:0", DropReason::BufferFull, 7);
        assert_eq!(ledger.len(), 3);

        let runs = ledger.drain();
        assert!(ledger.is_empty());
        assert_eq!(runs.len(), 3);

        let (key, run) = &runs[0];
        assert_eq!(key.client_id, "c1");
        assert_eq!(key.topic, "panes:a:0");
        assert_eq!(
            *run,
            DropRun {
                count: 3,
                first_seq: 4,
                last_seq: 9
            }
        );
        assert_eq!(runs[1].1.first_seq, 6);
        assert_eq!(runs[2].1.first_seq, 7);
    }

    #[test]
    fn test_reasons_are_separate_keys() {
        let mut ledger = DropLedger::new(100);
        ledger.record("c1", "t", DropReason::BufferFull, 1);
        ledger.record("c1", "t", DropReason::ClientGone, 2);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_signals_early_flush() {
        let mut ledger = DropLedger::new(2);
        assert!(!ledger.record("a", "t", DropReason::BufferFull, 1));
        assert!(!ledger.record("a", "t", DropReason::BufferFull, 2));
        assert!(ledger.record("b", "t", DropReason::BufferFull, 3));
    }
}
