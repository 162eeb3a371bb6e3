//! Fixed-capacity ring of recent events
//!
//! Events are pushed in sequence order, so the logical contents are always
//! sorted by `seq` and lookups can binary-search. Pushing into a full ring
//! overwrites the oldest slot.

use std::sync::Arc;

use crate::types::StoredEvent;

#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<Arc<StoredEvent>>>,
    /// Physical index of the oldest element
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append, returning the evicted event when the ring was full
    pub fn push(&mut self, event: Arc<StoredEvent>) -> Option<Arc<StoredEvent>> {
        let cap = self.capacity();
        if self.len < cap {
            let idx = (self.head + self.len) % cap;
            self.slots[idx] = Some(event);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(event);
            self.head = (self.head + 1) % cap;
            evicted
        }
    }

    /// Logical index 0 is the oldest event
    fn get(&self, i: usize) -> Option<&Arc<StoredEvent>> {
        if i >= self.len {
            return None;
        }
        self.slots[(self.head + i) % self.capacity()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StoredEvent>> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    pub fn oldest_seq(&self) -> Option<i64> {
        self.get(0).map(|e| e.seq)
    }

    pub fn newest_seq(&self) -> Option<i64> {
        self.len.checked_sub(1).and_then(|i| self.get(i)).map(|e| e.seq)
    }

    /// Logical index of the first event with `seq > since`
    fn partition_after(&self, since: i64) -> usize {
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.get(mid) {
                Some(e) if e.seq <= since => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    pub fn contains_seq(&self, seq: i64) -> bool {
        let idx = self.partition_after(seq - 1);
        self.get(idx).map(|e| e.seq == seq).unwrap_or(false)
    }

    /// Up to `limit` events with `seq > since` that satisfy `pred`, oldest first
    pub fn scan_after<F>(&self, since: i64, limit: usize, mut pred: F) -> Vec<Arc<StoredEvent>>
    where
        F: FnMut(&StoredEvent) -> bool,
    {
        let start = self.partition_after(since);
        (start..self.len)
            .filter_map(|i| self.get(i))
            .filter(|e| pred(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The newest `n` events, oldest first
    pub fn tail(&self, n: usize) -> Vec<Arc<StoredEvent>> {
        let skip = self.len.saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }
}
