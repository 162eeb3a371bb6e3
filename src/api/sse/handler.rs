//! `GET /events` - historical replay over server-sent events
//!
//! Without `follow` the stream ends after the replay. With `follow=true`
//! the stream is registered as a hub client before the replay starts, and
//! live frames already covered by the replay are skipped.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::api::rest::ApiError;
use crate::api::websocket::state::AppState;
use crate::hub::{ClientOptions, HubHandle, OutboundFrame, ReplayItem, ServerMessage};
use crate::topic::{validate_pattern, TopicFilter};

/// Query parameters for `GET /events`
#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    /// Replay events with seq greater than this
    pub since: Option<i64>,
    /// Topic pattern, default `*`
    pub topic: Option<String>,
    /// Cap on replayed events; ignored when following
    pub limit: Option<usize>,
    /// Keep the stream open for live events
    #[serde(default)]
    pub follow: bool,
}

/// Unregisters the live client when the response stream is dropped
struct ClientGuard {
    hub: HubHandle,
    id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        debug!(client_id = %self.id, "sse client disconnected");
        self.hub.unregister(&self.id);
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn to_sse(frame: &OutboundFrame) -> Event {
    let event = Event::default().data(&*frame.text);
    match frame.seq {
        Some(seq) => event.id(seq.to_string()),
        None => event,
    }
}

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<EventsParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let topic = params.topic.unwrap_or_else(|| "*".to_string());
    validate_pattern(&topic)?;
    let since = params.since.or_else(|| last_event_id(&headers)).unwrap_or(0);
    let limit = if params.follow {
        None
    } else {
        params.limit.filter(|l| *l > 0)
    };

    let live = if params.follow {
        let options = ClientOptions::new("sse").subscribe([topic.clone()]);
        Some(state.hub.register(options).await?)
    } else {
        None
    };
    let guard = live.as_ref().map(|r| ClientGuard {
        hub: state.hub.clone(),
        id: r.id.clone(),
    });
    let outbound = live.map(|r| r.outbound);
    let mut replay = state
        .hub
        .replay_topics(TopicFilter::single(topic.clone()), since);
    let shutdown = state.shutdown.clone();
    debug!(topic = %topic, since, follow = params.follow, "sse stream opened");

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut high_water = since;
        let mut sent = 0usize;
        let mut ended = false;

        while let Some(item) = replay.next().await {
            match item {
                Ok(ReplayItem::Event(frame)) => {
                    if limit.is_some_and(|l| sent >= l) {
                        break;
                    }
                    high_water = high_water.max(frame.seq.unwrap_or(0));
                    sent += 1;
                    yield Ok::<_, Infallible>(to_sse(&frame));
                }
                Ok(ReplayItem::Reset(frame)) => {
                    yield Ok::<_, Infallible>(to_sse(&frame));
                    ended = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "sse replay failed");
                    let frame = OutboundFrame::notice(&ServerMessage::error("INTERNAL_ERROR", e.to_string()));
                    yield Ok::<_, Infallible>(to_sse(&frame));
                    ended = true;
                    break;
                }
            }
        }

        if let (false, Some(outbound)) = (ended, outbound) {
            let live = ReceiverStream::new(outbound).take_until(shutdown.cancelled());
            tokio::pin!(live);
            while let Some(frame) = live.next().await {
                match frame.seq {
                    Some(seq) if seq <= high_water => continue,
                    Some(seq) => high_water = seq,
                    None => {}
                }
                yield Ok::<_, Infallible>(to_sse(&frame));
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keepalive_interval())))
}
