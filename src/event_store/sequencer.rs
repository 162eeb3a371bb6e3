//! Monotonic sequence numbers
//!
//! The sequencer is the single source of `seq` values. Numbers are handed out
//! strictly increasing with no duplicates, starting at 1 for a fresh store or
//! `max(log seq) + 1` after a restart.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct Sequencer {
    last: AtomicI64,
}

impl Sequencer {
    /// Fresh sequencer; the first value is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// The first value handed out will be `first` (never less than 1)
    pub fn starting_at(first: i64) -> Self {
        Self {
            last: AtomicI64::new(first.max(1) - 1),
        }
    }

    /// Continue after the highest persisted value
    pub fn resume_after(max_seq: Option<i64>) -> Self {
        Self::starting_at(max_seq.unwrap_or(0) + 1)
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest value handed out so far (0 when none)
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}
