//! Event Store statistics
//!
//! Cheap snapshots of ring occupancy and log size, served by
//! `GET /events/stats`.

use serde::Serialize;

use super::log::LogStats;

/// Ring buffer occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub used: usize,
    pub oldest_seq: Option<i64>,
    pub newest_seq: Option<i64>,
}

impl BufferStats {
    /// Fraction of the ring in use, 0.0..=1.0
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

/// Everything the store knows about itself
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub current_seq: i64,
    pub buffer: BufferStats,
    /// Absent when running memory-only
    pub log: Option<LogStats>,
    pub retention_seconds: u64,
}

impl StoreStats {
    pub fn persistent(&self) -> bool {
        self.log.is_some()
    }
}
