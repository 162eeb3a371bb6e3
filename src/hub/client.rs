//! Per-client state owned by the hub loop
//!
//! Transports (WebSocket, SSE) never touch this directly: they hold the
//! receiving half of the outbound queue and talk to the hub by client id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::topic::matches;
use crate::types::DropReason;

use super::frames::ServerMessage;
use super::ledger::DropRun;

/// A frame queued for a client
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Present for event envelopes, absent for notices
    pub seq: Option<i64>,
    pub text: Arc<str>,
}

impl OutboundFrame {
    pub fn event(seq: i64, text: Arc<str>) -> Self {
        Self {
            seq: Some(seq),
            text,
        }
    }

    pub fn notice(message: &ServerMessage) -> Self {
        Self {
            seq: None,
            text: Arc::from(message.to_json()),
        }
    }
}

/// Options supplied when registering a client
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Initial subscription patterns
    pub subscriptions: Vec<String>,
    /// Transport label for diagnostics (`ws`, `sse`)
    pub transport: String,
    /// Outbound queue capacity; the hub default applies when `None`
    pub outbound_capacity: Option<usize>,
}

impl ClientOptions {
    pub fn new(transport: &str) -> Self {
        Self {
            transport: transport.to_string(),
            ..Default::default()
        }
    }

    pub fn subscribe<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = Some(capacity);
        self
    }
}

/// Handed to the transport after registration
#[derive(Debug)]
pub struct ClientRegistration {
    pub id: String,
    pub outbound: mpsc::Receiver<OutboundFrame>,
    /// Highest seq at registration time
    pub current_seq: i64,
}

/// Per-client counters exposed through hub stats
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub id: String,
    pub transport: String,
    pub subscriptions: Vec<String>,
    pub delivered: u64,
    pub dropped: u64,
    pub pending_notices: usize,
    pub queued: usize,
    pub connected_at: DateTime<Utc>,
}

pub(crate) enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

enum NoticeFlush {
    Clear,
    Pending,
    Closed,
}

pub(crate) struct ClientEntry {
    id: String,
    transport: String,
    outbound: mpsc::Sender<OutboundFrame>,
    subscriptions: BTreeSet<String>,
    /// Drop runs not yet announced to the client, by topic
    notices: BTreeMap<String, DropRun>,
    delivered: u64,
    dropped: u64,
    connected_at: DateTime<Utc>,
}

impl ClientEntry {
    pub(crate) fn new(
        id: String,
        transport: String,
        outbound: mpsc::Sender<OutboundFrame>,
        subscriptions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id,
            transport,
            outbound,
            subscriptions: subscriptions.into_iter().collect(),
            notices: BTreeMap::new(),
            delivered: 0,
            dropped: 0,
            connected_at: Utc::now(),
        }
    }

    pub(crate) fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|p| matches(p, topic))
    }

    pub(crate) fn subscribe(&mut self, patterns: Vec<String>) -> Vec<String> {
        self.subscriptions.extend(patterns);
        self.subscriptions()
    }

    pub(crate) fn unsubscribe(&mut self, patterns: &[String]) -> Vec<String> {
        for p in patterns {
            self.subscriptions.remove(p);
        }
        self.subscriptions()
    }

    /// Drop all subscriptions, returning what was removed
    pub(crate) fn reset(&mut self) -> Vec<String> {
        std::mem::take(&mut self.subscriptions).into_iter().collect()
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.iter().cloned().collect()
    }

    /// Try to hand an event to the client without waiting
    ///
    /// Pending drop notices go out first so they stay ordered between the
    /// last delivered event before the run and the first one after it.
    pub(crate) fn deliver(
        &mut self,
        seq: i64,
        topic: &str,
        text: &Arc<str>,
        now: DateTime<Utc>,
    ) -> Delivery {
        match self.flush_notices_inner(now) {
            NoticeFlush::Clear => {}
            NoticeFlush::Pending => {
                self.note_drop(topic, seq);
                return Delivery::Dropped;
            }
            NoticeFlush::Closed => return Delivery::Closed,
        }

        match self.outbound.try_send(OutboundFrame::event(seq, text.clone())) {
            Ok(()) => {
                self.delivered += 1;
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                self.note_drop(topic, seq);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Announce pending drop runs. Returns `false` when the queue is closed.
    pub(crate) fn flush_notices(&mut self, now: DateTime<Utc>) -> bool {
        !matches!(self.flush_notices_inner(now), NoticeFlush::Closed)
    }

    fn flush_notices_inner(&mut self, now: DateTime<Utc>) -> NoticeFlush {
        if self.notices.is_empty() {
            return NoticeFlush::Clear;
        }

        let mut runs: Vec<(String, DropRun)> =
            self.notices.iter().map(|(t, r)| (t.clone(), *r)).collect();
        runs.sort_by_key(|(_, run)| run.first_seq);

        for (topic, run) in runs {
            let notice = ServerMessage::dropped(
                &topic,
                DropReason::BufferFull,
                run.count,
                run.first_seq,
                run.last_seq,
                now,
            );
            match self.outbound.try_send(OutboundFrame::notice(&notice)) {
                Ok(()) => {
                    self.notices.remove(&topic);
                }
                Err(TrySendError::Full(_)) => return NoticeFlush::Pending,
                Err(TrySendError::Closed(_)) => return NoticeFlush::Closed,
            }
        }
        NoticeFlush::Clear
    }

    fn note_drop(&mut self, topic: &str, seq: i64) {
        self.dropped += 1;
        self.notices
            .entry(topic.to_string())
            .and_modify(|run| run.extend(seq))
            .or_insert_with(|| DropRun::new(seq));
    }

    pub(crate) fn stats(&self) -> ClientStats {
        ClientStats {
            id: self.id.clone(),
            transport: self.transport.clone(),
            subscriptions: self.subscriptions(),
            delivered: self.delivered,
            dropped: self.dropped,
            pending_notices: self.notices.len(),
            queued: self.outbound.max_capacity() - self.outbound.capacity(),
            connected_at: self.connected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn entry(capacity: usize, subs: &[&str]) -> (ClientEntry, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let entry = ClientEntry::new(
            "c1".to_string(),
            "test".to_string(),
            tx,
            subs.iter().map(|s| s.to_string()),
        );
        (entry, rx)
    }

    fn text(seq: i64) -> Arc<str> {
        Arc::from(format!("{{\"seq\":{}}}", seq))
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let (mut client, _rx) = entry(4, &[]);
        client.subscribe(vec!["jobs:*".to_string()]);
        let subs = client.subscribe(vec!["jobs:*".to_string()]);
        assert_eq!(subs, vec!["jobs:*".to_string()]);
        assert!(client.is_subscribed("jobs:1"));

        let subs = client.unsubscribe(&["jobs:*".to_string()]);
        assert!(subs.is_empty());
        assert!(!client.is_subscribed("jobs:1"));
    }

    #[test]
    fn test_full_queue_drops_and_notice_precedes_next_event() {
        let (mut client, mut rx) = entry(2, &["panes:*"]);
        let now = Utc::now();

        assert!(matches!(client.deliver(1, "panes:a:0", &text(1), now), Delivery::Delivered));
        assert!(matches!(client.deliver(2, "panes:a:0", &text(2), now), Delivery::Delivered));
        assert!(matches!(client.deliver(3, "panes:a:0", &text(3), now), Delivery::Dropped));
        assert!(matches!(client.deliver(4, "panes:a:0", &text(4), now), Delivery::Dropped));
        assert_eq!(client.stats().pending_notices, 1);

        // drain both queued events
        assert_eq!(rx.try_recv().unwrap().seq, Some(1));
        assert_eq!(rx.try_recv().unwrap().seq, Some(2));

        assert!(matches!(client.deliver(5, "panes:a:0", &text(5), now), Delivery::Delivered));

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.seq, None);
        let value: Value = serde_json::from_str(&notice.text).unwrap();
        assert_eq!(value["type"], "pane.output.dropped");
        assert_eq!(value["dropped_count"], 2);
        assert_eq!(value["first_seq"], 3);
        assert_eq!(value["last_seq"], 4);

        assert_eq!(rx.try_recv().unwrap().seq, Some(5));

        let stats = client.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.pending_notices, 0);
    }

    #[test]
    fn test_closed_queue_is_reported() {
        let (mut client, rx) = entry(2, &["*"]);
        drop(rx);
        assert!(matches!(client.deliver(1, "t", &text(1), Utc::now()), Delivery::Closed));
    }

    #[test]
    fn test_reset_clears_subscriptions() {
        let (mut client, _rx) = entry(2, &["a", "b:*"]);
        let removed = client.reset();
        assert_eq!(removed.len(), 2);
        assert!(client.subscriptions().is_empty());
    }
}
