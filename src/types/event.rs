//! Event types for the event backbone
//!
//! A [`StoredEvent`] is the immutable record produced by every publish. Its
//! payload is kept in serialized form so the exact bytes seen by live
//! subscribers are the bytes later served to replaying clients.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable, sequence-numbered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Process-wide monotonic sequence number (starts at 1)
    pub seq: i64,

    /// Colon-separated topic, e.g. `sessions:abc` or `panes:abc:0`
    pub topic: String,

    /// Domain tag such as `pane.output` or `job.completed`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Serialized JSON payload
    pub data: String,

    /// Wall-clock publication time (UTC)
    pub created_at: DateTime<Utc>,
}

/// Why an event could not be delivered to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The client's outbound queue was full
    BufferFull,
    /// The client disconnected or was evicted
    ClientGone,
    /// The client's resume cursor fell out of retention
    CursorExpired,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::BufferFull => "buffer_full",
            DropReason::ClientGone => "client_gone",
            DropReason::CursorExpired => "cursor_expired",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DropReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buffer_full" => Ok(DropReason::BufferFull),
            "client_gone" => Ok(DropReason::ClientGone),
            "cursor_expired" => Ok(DropReason::CursorExpired),
            other => Err(format!("unknown drop reason '{}'", other)),
        }
    }
}

/// Persisted accounting of events a client did not receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEventRecord {
    /// Row id once persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub client_id: String,
    pub topic: String,
    pub reason: DropReason,
    pub dropped_count: i64,
    pub first_dropped_seq: i64,
    pub last_dropped_seq: i64,
    pub created_at: DateTime<Utc>,
}

impl DroppedEventRecord {
    /// Build a record covering the contiguous range `first_seq..=last_seq`
    pub fn for_range(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        reason: DropReason,
        first_seq: i64,
        last_seq: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let count = (last_seq - first_seq + 1).max(1);
        Self::with_count(client_id, topic, reason, count, first_seq, last_seq, created_at)
    }

    /// Build a record with an explicit count (coalesced, non-contiguous drops)
    pub fn with_count(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        reason: DropReason,
        dropped_count: i64,
        first_seq: i64,
        last_seq: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            client_id: client_id.into(),
            topic: topic.into(),
            reason,
            dropped_count: dropped_count.max(1),
            first_dropped_seq: first_seq,
            last_dropped_seq: last_seq,
            created_at,
        }
    }
}
