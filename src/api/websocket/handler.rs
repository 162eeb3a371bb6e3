//! WebSocket connection handler
//!
//! Each connection is a hub client with two tasks: the writer drains the
//! hub's outbound queue plus direct replies, the reader handles control
//! frames. Replayed frames always reach the socket before live frames
//! queued after them, and live frames already covered by a replay are
//! skipped.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::AppState;
use crate::error::HubError;
use crate::hub::{ClientMessage, ClientOptions, OutboundFrame, ReplayItem, ReplayStream, ServerMessage};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Comma-separated initial subscriptions
    pub topics: Option<String>,
    /// Resume from this seq right after connecting
    pub since: Option<i64>,
}

impl WsParams {
    fn topics(&self) -> Vec<String> {
        self.topics
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Work for the writer task besides the hub queue
enum WriterCommand {
    Frame(OutboundFrame),
    Replay(ReplayStream),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Handle an individual WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, params: WsParams) {
    let options = ClientOptions::new("ws").subscribe(params.topics());
    let registration = match state.hub.register(options).await {
        Ok(r) => r,
        Err(e) => {
            let code = match e {
                HubError::InvalidPattern { .. } => "INVALID_PATTERN",
                _ => "UNAVAILABLE",
            };
            let frame = ServerMessage::error(code, e.to_string()).to_json();
            let _ = socket.send(Message::Text(frame)).await;
            let _ = socket.close().await;
            return;
        }
    };
    let client_id = registration.id.clone();
    info!(client_id = %client_id, "websocket client connected");

    let (commands, command_rx) = mpsc::channel(64);
    let connected = ServerMessage::Connected {
        client_id: client_id.clone(),
        current_seq: registration.current_seq,
    };
    let _ = commands
        .send(WriterCommand::Frame(OutboundFrame::notice(&connected)))
        .await;
    if let Some(since) = params.since {
        resume(&state, &client_id, since, &commands).await;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        registration.outbound,
        command_rx,
        state.keepalive_interval(),
    ));

    read_loop(stream, &state, &client_id, &commands).await;
    state.hub.unregister(&client_id);
    drop(commands);
    if let Err(e) = writer.await {
        warn!(client_id = %client_id, error = %e, "websocket writer task failed");
    }
    info!(client_id = %client_id, "websocket client disconnected");
}

/// Runs until the client closes, goes quiet past the idle timeout, or the
/// server shuts down
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    client_id: &str,
    commands: &mpsc::Sender<WriterCommand>,
) {
    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            next = tokio::time::timeout(state.idle_timeout, stream.next()) => next,
        };
        let message = match next {
            Err(_) => {
                warn!(client_id, idle_timeout = ?state.idle_timeout, "websocket client idle, evicting");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(client_id, error = %e, "websocket read error");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(control) => handle_control(control, state, client_id, commands).await,
                    Err(e) => Some(ServerMessage::error(
                        "BAD_REQUEST",
                        format!("malformed control frame: {}", e),
                    )),
                };
                if let Some(reply) = reply {
                    if commands
                        .send(WriterCommand::Frame(OutboundFrame::notice(&reply)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Message::Close(_) => return,
            // axum answers pings itself; any frame counts as activity
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Apply one control frame; returns the direct reply, if any
async fn handle_control(
    control: ClientMessage,
    state: &AppState,
    client_id: &str,
    commands: &mpsc::Sender<WriterCommand>,
) -> Option<ServerMessage> {
    match control {
        ClientMessage::Subscribe { topics } => Some(match state.hub.subscribe(client_id, topics).await {
            Ok(topics) => ServerMessage::Subscribed { topics },
            Err(e) => hub_error(e),
        }),
        ClientMessage::Unsubscribe { topics } => {
            Some(match state.hub.unsubscribe(client_id, topics).await {
                Ok(topics) => ServerMessage::Unsubscribed { topics },
                Err(e) => hub_error(e),
            })
        }
        ClientMessage::Resume { since } => {
            resume(state, client_id, since, commands).await;
            None
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

async fn resume(
    state: &AppState,
    client_id: &str,
    since: i64,
    commands: &mpsc::Sender<WriterCommand>,
) {
    let command = match state.hub.replay(client_id, since).await {
        Ok(stream) => WriterCommand::Replay(stream),
        Err(e) => WriterCommand::Frame(OutboundFrame::notice(&hub_error(e))),
    };
    debug!(client_id, since, "websocket resume requested");
    let _ = commands.send(command).await;
}

fn hub_error(e: HubError) -> ServerMessage {
    match e {
        HubError::InvalidPattern { .. } => ServerMessage::error("INVALID_PATTERN", e.to_string()),
        _ => ServerMessage::error("INTERNAL_ERROR", e.to_string()),
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    mut commands: mpsc::Receiver<WriterCommand>,
    ping_every: Duration,
) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    // Highest seq written; live frames at or below it were replayed already
    let mut high_water = 0i64;

    loop {
        let sent = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(WriterCommand::Frame(frame)) => send_text(&mut sink, &frame).await,
                Some(WriterCommand::Replay(stream)) => {
                    write_replay(&mut sink, stream, &mut high_water).await
                }
                None => break,
            },
            frame = outbound.recv() => match frame {
                Some(frame) => match frame.seq {
                    Some(seq) if seq <= high_water => true,
                    seq => {
                        high_water = high_water.max(seq.unwrap_or(0));
                        send_text(&mut sink, &frame).await
                    }
                },
                // Evicted or hub shut down
                None => break,
            },
            _ = ping.tick() => sink.send(Message::Ping(Vec::new())).await.is_ok(),
        };
        if !sent {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn write_replay(
    sink: &mut SplitSink<WebSocket, Message>,
    mut stream: ReplayStream,
    high_water: &mut i64,
) -> bool {
    while let Some(item) = stream.next().await {
        match item {
            Ok(item) => {
                if let ReplayItem::Event(frame) = &item {
                    *high_water = (*high_water).max(frame.seq.unwrap_or(0));
                }
                if !send_text(sink, item.frame()).await {
                    return false;
                }
            }
            Err(e) => {
                warn!(error = %e, "replay failed");
                let frame = OutboundFrame::notice(&hub_error(e));
                return send_text(sink, &frame).await;
            }
        }
    }
    true
}

async fn send_text(sink: &mut SplitSink<WebSocket, Message>, frame: &OutboundFrame) -> bool {
    sink.send(Message::Text(frame.text.to_string())).await.is_ok()
}
