//! Event Store - sequenced publish and replay
//!
//! The store assigns every event its `seq`, keeps the newest events in a
//! ring buffer and (optionally) mirrors every event to the durable
//! [`AppendLog`]. Replays are served from the ring when it still covers the
//! requested cursor and from the log otherwise.
//!
//! Sequence assignment, the ring push and the log enqueue happen under one
//! lock, so the ring and the log both see events in `seq` order.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::error::StoreError;
use crate::topic::TopicFilter;
use crate::types::{DropReason, DroppedEventRecord, StoredEvent};
use crate::utils::time::{epoch_millis, from_epoch_millis, system_clock, Clock};

use super::log::{AppendLog, PruneReport, DEFAULT_QUEUE_CAPACITY};
use super::ring::RingBuffer;
use super::sequencer::Sequencer;
use super::stats::{BufferStats, StoreStats};

/// Configuration for the EventStore
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Ring buffer capacity
    pub buffer_size: usize,
    /// How long events stay in the durable log
    pub retention: Duration,
    /// How long drop records stay in the durable log
    pub dropped_retention: Duration,
    /// Replay page size used when the caller passes no limit
    pub default_limit: usize,
    /// Appends allowed to wait for the log writer before being discarded
    pub log_queue_capacity: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            retention: Duration::from_secs(3600),
            dropped_retention: Duration::from_secs(24 * 3600),
            default_limit: 1000,
            log_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl EventStoreConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Result of a replay query
#[derive(Debug, Clone, Default)]
pub struct Replay {
    /// Matching events in ascending `seq` order
    pub events: Vec<Arc<StoredEvent>>,
    /// The cursor fell out of retention; the caller must resynchronize
    pub needs_reset: bool,
}

impl Replay {
    fn reset() -> Self {
        Self {
            events: Vec::new(),
            needs_reset: true,
        }
    }

    pub fn last_seq(&self) -> Option<i64> {
        self.events.last().map(|e| e.seq)
    }
}

struct RingState {
    buffer: RingBuffer,
    last_created_at: Option<DateTime<Utc>>,
}

/// Anything jobs and pipelines can publish lifecycle events into
pub trait EventSink: Send + Sync {
    fn publish_value(
        &self,
        topic: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Arc<StoredEvent>, StoreError>;
}

/// Sequenced event store with optional durable log
pub struct EventStore {
    config: EventStoreConfig,
    sequencer: Sequencer,
    ring: Mutex<RingState>,
    log: Option<AppendLog>,
    clock: Arc<dyn Clock>,
}

impl EventStore {
    /// Store without a durable log; replays are limited to the ring
    pub fn memory_only(config: EventStoreConfig) -> Self {
        Self::build(config, None, Sequencer::new(), Vec::new())
    }

    /// Store backed by `log`; resumes numbering after the log's highest seq
    /// and pre-loads the ring with the newest persisted events
    pub fn with_log(config: EventStoreConfig, log: AppendLog) -> Result<Self, StoreError> {
        let max_seq = log.max_seq()?;
        let warm = log.tail(config.buffer_size)?;
        let sequencer = Sequencer::resume_after(max_seq);
        info!(
            next_seq = sequencer.current() + 1,
            warmed = warm.len(),
            "event store resumed from log"
        );
        Ok(Self::build(config, Some(log), sequencer, warm))
    }

    /// Open the log at `path` and build a store on it
    pub fn open<P: AsRef<std::path::Path>>(
        config: EventStoreConfig,
        path: P,
    ) -> Result<Self, StoreError> {
        let log = AppendLog::open_with_capacity(path, config.log_queue_capacity)?;
        Self::with_log(config, log)
    }

    fn build(
        config: EventStoreConfig,
        log: Option<AppendLog>,
        sequencer: Sequencer,
        warm: Vec<StoredEvent>,
    ) -> Self {
        let mut buffer = RingBuffer::new(config.buffer_size);
        let last_created_at = warm.last().map(|e| e.created_at);
        for event in warm {
            buffer.push(Arc::new(event));
        }
        Self {
            config,
            sequencer,
            ring: Mutex::new(RingState {
                buffer,
                last_created_at,
            }),
            log,
            clock: system_clock(),
        }
    }

    /// Replace the clock (tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    pub fn log(&self) -> Option<&AppendLog> {
        self.log.as_ref()
    }

    /// Assign the next seq, buffer the event and queue it for persistence
    ///
    /// Serialization failures are reported before a seq is consumed.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<Arc<StoredEvent>, StoreError> {
        if topic.is_empty() {
            return Err(StoreError::EmptyTopic);
        }
        let data = serde_json::to_string(payload)?;

        let mut ring = self.ring.lock();
        // Millisecond precision so ring and log copies compare equal
        let now = from_epoch_millis(epoch_millis(&self.clock.now()));
        let created_at = match ring.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        ring.last_created_at = Some(created_at);

        let event = Arc::new(StoredEvent {
            seq: self.sequencer.next(),
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            data,
            created_at,
        });
        ring.buffer.push(event.clone());
        if let Some(log) = &self.log {
            log.append(event.clone());
        }
        drop(ring);

        trace!(seq = event.seq, topic = %event.topic, event_type = %event.event_type, "event published");
        Ok(event)
    }

    /// Highest seq assigned so far (0 before the first publish)
    pub fn current_seq(&self) -> i64 {
        self.sequencer.current()
    }

    /// Earliest seq that can still be replayed
    pub async fn oldest_available(&self) -> Result<i64, StoreError> {
        let ring_oldest = self.ring.lock().buffer.oldest_seq();
        let log_oldest = match &self.log {
            Some(log) => {
                log.flush().await?;
                log.min_seq().await?
            }
            None => None,
        };
        let oldest = match (ring_oldest, log_oldest) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b).unwrap_or(self.current_seq() + 1),
        };
        Ok(oldest)
    }

    /// Events after `since` whose topic matches `pattern`
    pub async fn get_since(
        &self,
        since: i64,
        pattern: &str,
        limit: usize,
    ) -> Result<Replay, StoreError> {
        self.get_since_matching(since, &TopicFilter::single(pattern), limit)
            .await
    }

    /// Events after `since` whose topic matches any pattern in `filter`
    ///
    /// A `limit` of zero selects the configured default. `needs_reset` is set
    /// whenever events between `since` and the oldest retained event are no
    /// longer available.
    pub async fn get_since_matching(
        &self,
        since: i64,
        filter: &TopicFilter,
        limit: usize,
    ) -> Result<Replay, StoreError> {
        let since = since.max(0);
        let limit = if limit == 0 {
            self.config.default_limit
        } else {
            limit
        };

        {
            let ring = self.ring.lock();
            let oldest = ring
                .buffer
                .oldest_seq()
                .unwrap_or_else(|| self.sequencer.current() + 1);
            if ring.buffer.contains_seq(since) || since >= oldest - 1 {
                let events = ring
                    .buffer
                    .scan_after(since, limit, |e| filter.matches(&e.topic));
                return Ok(Replay {
                    events,
                    needs_reset: false,
                });
            }
        }

        let Some(log) = &self.log else {
            debug!(since, "cursor older than ring and no event log");
            return Ok(Replay::reset());
        };

        log.flush().await?;
        match log.min_seq().await? {
            Some(min) if min <= since + 1 => {}
            min => {
                debug!(since, oldest = ?min, "cursor fell out of retention");
                return Ok(Replay::reset());
            }
        }

        let page = limit.saturating_mul(10).max(1);
        let mut cursor = since;
        let mut events = Vec::new();
        loop {
            let rows = log.range(cursor, page).await?;
            let fetched = rows.len();
            for event in rows {
                cursor = event.seq;
                if filter.matches(&event.topic) {
                    events.push(Arc::new(event));
                    if events.len() == limit {
                        return Ok(Replay {
                            events,
                            needs_reset: false,
                        });
                    }
                }
            }
            if fetched < page {
                break;
            }
        }

        Ok(Replay {
            events,
            needs_reset: false,
        })
    }

    /// Persist accounting for a contiguous run of missed events
    pub fn record_dropped(
        &self,
        client_id: &str,
        topic: &str,
        reason: DropReason,
        first_seq: i64,
        last_seq: i64,
    ) {
        let record = DroppedEventRecord::for_range(
            client_id,
            topic,
            reason,
            first_seq,
            last_seq,
            self.clock.now(),
        );
        self.persist_dropped(record);
    }

    /// Persist accounting with an explicit count (coalesced runs)
    pub fn record_dropped_count(
        &self,
        client_id: &str,
        topic: &str,
        reason: DropReason,
        count: i64,
        first_seq: i64,
        last_seq: i64,
    ) {
        let record = DroppedEventRecord::with_count(
            client_id,
            topic,
            reason,
            count,
            first_seq,
            last_seq,
            self.clock.now(),
        );
        self.persist_dropped(record);
    }

    fn persist_dropped(&self, record: DroppedEventRecord) {
        match &self.log {
            Some(log) => log.record_dropped(record),
            None => debug!(
                client_id = %record.client_id,
                topic = %record.topic,
                reason = %record.reason,
                count = record.dropped_count,
                "drop record not persisted (no event log)"
            ),
        }
    }

    /// Persisted drop records, newest first
    pub async fn dropped_events(
        &self,
        client_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DroppedEventRecord>, StoreError> {
        let log = self.log.as_ref().ok_or(StoreError::LogUnavailable)?;
        log.flush().await?;
        let limit = if limit == 0 {
            self.config.default_limit
        } else {
            limit
        };
        log.dropped_events(client_id.map(str::to_string), limit)
            .await
    }

    /// Wait until every published event has been committed to the log
    pub async fn flush(&self) -> Result<(), StoreError> {
        match &self.log {
            Some(log) => log.flush().await,
            None => Ok(()),
        }
    }

    /// Apply retention to the log. `None` when there is no log.
    pub async fn prune(&self) -> Result<Option<PruneReport>, StoreError> {
        let Some(log) = &self.log else {
            return Ok(None);
        };
        let now = epoch_millis(&self.clock.now());
        let cutoff = |keep: Duration| now.saturating_sub(keep.as_millis().min(i64::MAX as u128) as i64);

        log.flush().await?;
        let report = log
            .prune(cutoff(self.config.retention), cutoff(self.config.dropped_retention))
            .await?;
        if report.events_deleted > 0 || report.dropped_deleted > 0 {
            info!(
                events_deleted = report.events_deleted,
                dropped_deleted = report.dropped_deleted,
                "event log pruned"
            );
        } else {
            debug!("event log prune found nothing to delete");
        }
        Ok(Some(report))
    }

    pub fn buffer_stats(&self) -> BufferStats {
        let ring = self.ring.lock();
        BufferStats {
            capacity: ring.buffer.capacity(),
            used: ring.buffer.len(),
            oldest_seq: ring.buffer.oldest_seq(),
            newest_seq: ring.buffer.newest_seq(),
        }
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let log = match &self.log {
            Some(log) => Some(log.stats().await?),
            None => None,
        };
        Ok(StoreStats {
            current_seq: self.current_seq(),
            buffer: self.buffer_stats(),
            log,
            retention_seconds: self.config.retention.as_secs(),
        })
    }
}

impl EventSink for EventStore {
    fn publish_value(
        &self,
        topic: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Arc<StoredEvent>, StoreError> {
        self.publish(topic, event_type, &payload)
    }
}
