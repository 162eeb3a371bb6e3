//! Historical replay for resuming clients
//!
//! Replays page through the store in `replay_limit` chunks so a client far
//! behind never forces one huge allocation. A cursor that fell out of
//! retention yields a single reset frame and ends the stream.

use std::pin::Pin;

use chrono::Utc;
use futures::Stream;
use tracing::{debug, info};

use crate::error::HubError;
use crate::topic::TopicFilter;
use crate::types::DropReason;

use super::broadcaster::HubHandle;
use super::client::OutboundFrame;
use super::frames::ServerMessage;

/// One replayed frame
#[derive(Debug, Clone)]
pub enum ReplayItem {
    /// Historical event envelope
    Event(OutboundFrame),
    /// `stream.reset`; always the last item
    Reset(OutboundFrame),
}

impl ReplayItem {
    pub fn frame(&self) -> &OutboundFrame {
        match self {
            ReplayItem::Event(frame) | ReplayItem::Reset(frame) => frame,
        }
    }
}

pub type ReplayStream = Pin<Box<dyn Stream<Item = Result<ReplayItem, HubError>> + Send>>;

impl HubHandle {
    /// Replay everything after `since` matching the client's subscriptions
    ///
    /// On reset the client's subscriptions are cleared and a
    /// `cursor_expired` record is written; the client must subscribe again.
    pub async fn replay(&self, client_id: &str, since: i64) -> Result<ReplayStream, HubError> {
        let filter = TopicFilter::new(self.subscriptions(client_id).await?);
        Ok(self.replay_stream(filter, since, Some(client_id.to_string())))
    }

    /// Replay for a fixed set of patterns, without touching any client
    pub fn replay_topics(&self, filter: TopicFilter, since: i64) -> ReplayStream {
        self.replay_stream(filter, since, None)
    }

    fn replay_stream(
        &self,
        filter: TopicFilter,
        since: i64,
        client_id: Option<String>,
    ) -> ReplayStream {
        let hub = self.clone();
        Box::pin(async_stream::stream! {
            let limit = hub.config().replay_limit.max(1);
            let mut cursor = since.max(0);
            let mut replayed = 0usize;

            while !filter.is_empty() {
                let page = match hub.store().get_since_matching(cursor, &filter, limit).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(HubError::from(e));
                        break;
                    }
                };

                if page.needs_reset {
                    match hub.reset_frame(&filter, since, client_id.as_deref()).await {
                        Ok(frame) => yield Ok(ReplayItem::Reset(frame)),
                        Err(e) => yield Err(e),
                    }
                    break;
                }

                let fetched = page.events.len();
                for event in page.events {
                    cursor = event.seq;
                    if let Some(text) = hub.render(&event) {
                        replayed += 1;
                        yield Ok(ReplayItem::Event(OutboundFrame::event(event.seq, text)));
                    }
                }
                if fetched < limit {
                    break;
                }
            }

            debug!(since, replayed, client_id = ?client_id, "replay finished");
        })
    }

    async fn reset_frame(
        &self,
        filter: &TopicFilter,
        since: i64,
        client_id: Option<&str>,
    ) -> Result<OutboundFrame, HubError> {
        let store = self.store();
        let current = store.current_seq();
        let oldest = store.oldest_available().await?;
        let topics = filter.patterns().join(",");

        if let Some(id) = client_id {
            self.reset_subscriptions(id).await?;
            let first = since.max(0) + 1;
            let last = (oldest - 1).max(first);
            store.record_dropped(id, &topics, DropReason::CursorExpired, first, last);
        }
        info!(
            since,
            current_seq = current,
            oldest_available = oldest,
            client_id = ?client_id,
            "replay cursor expired"
        );

        Ok(OutboundFrame::notice(&ServerMessage::reset(
            topics,
            current,
            oldest,
            Utc::now(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use serde_json::{json, Value};

    use super::*;
    use crate::event_store::{EventStore, EventStoreConfig};
    use crate::hub::{ClientOptions, Hub, HubConfig};

    fn hub(buffer_size: usize, replay_limit: usize) -> HubHandle {
        let store = Arc::new(EventStore::memory_only(
            EventStoreConfig::default().with_buffer_size(buffer_size),
        ));
        Hub::spawn(
            store,
            HubConfig {
                replay_limit,
                ..Default::default()
            },
        )
    }

    async fn collect(stream: ReplayStream) -> Vec<ReplayItem> {
        stream.map(|item| item.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_replay_pages_through_matching_events() {
        let hub = hub(64, 2);
        for i in 0..7 {
            let topic = if i % 2 == 0 { "jobs:1" } else { "sessions:a" };
            hub.publish(topic, "e", &json!(i)).unwrap();
        }

        let items = collect(hub.replay_topics(TopicFilter::single("jobs:*"), 0)).await;
        let seqs: Vec<i64> = items.iter().filter_map(|i| i.frame().seq).collect();
        assert_eq!(seqs, vec![1, 3, 5, 7]);
    }

    #[tokio::test]
    async fn test_empty_filter_replays_nothing() {
        let hub = hub(8, 10);
        hub.publish("t", "e", &json!(1)).unwrap();
        let items = collect(hub.replay_topics(TopicFilter::new(Vec::<String>::new()), 0)).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_expired_cursor_resets_client() {
        let hub = hub(3, 10);
        let reg = hub
            .register(ClientOptions::new("test").subscribe(["*"]))
            .await
            .unwrap();
        for i in 0..10 {
            hub.publish("t", "e", &json!(i)).unwrap();
        }

        let items = collect(hub.replay(&reg.id, 1).await.unwrap()).await;
        assert_eq!(items.len(), 1);
        let ReplayItem::Reset(frame) = &items[0] else {
            panic!("expected reset");
        };
        let value: Value = serde_json::from_str(&frame.text).unwrap();
        assert_eq!(value["type"], "stream.reset");
        assert_eq!(value["current_seq"], 10);
        assert_eq!(value["oldest_available"], 8);

        assert!(hub.subscriptions(&reg.id).await.unwrap().is_empty());
    }
}
