//! Wire frames exchanged with streaming clients
//!
//! Every event reaches a client as an envelope
//! `{ seq, topic, type, ts, data }`. Everything else the server sends is a
//! [`ServerMessage`]; everything a client may send is a [`ClientMessage`].

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::types::{DropReason, StoredEvent};
use crate::utils::time::to_rfc3339;

use super::redact::Redactor;

/// Event envelope as delivered to subscribers
#[derive(Debug, Serialize)]
pub struct EventEnvelope<'a> {
    pub seq: i64,
    pub topic: &'a str,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub ts: String,
    pub data: &'a RawValue,
}

/// Serialize an event once for every recipient
///
/// The redactor runs over the payload text first; if it leaves behind
/// something that is no longer JSON the event is reported as an error and
/// callers skip it.
pub fn render_event(
    event: &StoredEvent,
    redactor: Option<&Redactor>,
) -> Result<String, serde_json::Error> {
    let data: Cow<'_, str> = match redactor {
        Some(r) => r.scrub(&event.data),
        None => Cow::Borrowed(event.data.as_str()),
    };
    let raw: &RawValue = serde_json::from_str(&data)?;
    serde_json::to_string(&EventEnvelope {
        seq: event.seq,
        topic: &event.topic,
        event_type: &event.event_type,
        ts: to_rfc3339(&event.created_at),
        data: raw,
    })
}

/// Control frames accepted from clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    /// Replay everything after `since`, then continue live
    Resume { since: i64 },
    /// Heartbeat
    Ping,
}

/// Summary of a run of events a client did not receive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropNotice {
    pub ts: String,
    pub topic: String,
    pub reason: DropReason,
    pub dropped_count: i64,
    pub first_seq: i64,
    pub last_seq: i64,
}

/// Cursor expiry notice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetNotice {
    pub ts: String,
    /// Subscriptions that were abandoned, joined with `,`
    pub topic: String,
    pub reason: DropReason,
    pub current_seq: i64,
    pub oldest_available: i64,
}

/// Frames the server sends besides event envelopes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every connection
    #[serde(rename = "connected")]
    Connected { client_id: String, current_seq: i64 },

    #[serde(rename = "subscribed")]
    Subscribed { topics: Vec<String> },

    #[serde(rename = "unsubscribed")]
    Unsubscribed { topics: Vec<String> },

    #[serde(rename = "pong")]
    Pong,

    /// Malformed or rejected control frame
    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "stream.reset")]
    StreamReset(ResetNotice),

    /// Drop run on a `panes:*` topic
    #[serde(rename = "pane.output.dropped")]
    PaneOutputDropped(DropNotice),

    /// Drop run on any other topic
    #[serde(rename = "stream.dropped")]
    StreamDropped(DropNotice),
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Drop notice, typed by the topic family
    pub fn dropped(
        topic: &str,
        reason: DropReason,
        dropped_count: i64,
        first_seq: i64,
        last_seq: i64,
        at: DateTime<Utc>,
    ) -> Self {
        let notice = DropNotice {
            ts: to_rfc3339(&at),
            topic: topic.to_string(),
            reason,
            dropped_count,
            first_seq,
            last_seq,
        };
        if topic.starts_with("panes:") {
            ServerMessage::PaneOutputDropped(notice)
        } else {
            ServerMessage::StreamDropped(notice)
        }
    }

    pub fn reset(topic: String, current_seq: i64, oldest_available: i64, at: DateTime<Utc>) -> Self {
        ServerMessage::StreamReset(ResetNotice {
            ts: to_rfc3339(&at),
            topic,
            reason: DropReason::CursorExpired,
            current_seq,
            oldest_available,
        })
    }

    pub fn to_json(&self) -> String {
        // Only strings and integers; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}
