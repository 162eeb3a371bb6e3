//! Fan-out hub
//!
//! One supervisor task owns the client registry. Publishers never touch it:
//! they go through [`HubHandle::publish`], which obtains a `seq` from the
//! [`EventStore`] and enqueues the event on the bounded dispatch channel.
//! The loop serializes each event once and offers it to every subscribed
//! client without waiting; a full client queue turns into drop accounting,
//! never into a stall.
//!
//! # Design
//!
//! ```text
//! publish ──► EventStore (seq) ──► dispatch channel ──► hub loop ──► client queues
//!                                    (full: global drop)   │
//!                                                          └──► drop ledger ──► store (250ms)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{HubError, StoreError};
use crate::event_store::{EventSink, EventStore};
use crate::topic::validate_pattern;
use crate::types::{DropReason, StoredEvent};

use super::client::{ClientEntry, ClientOptions, ClientRegistration, ClientStats, Delivery};
use super::frames::render_event;
use super::ledger::DropLedger;
use super::redact::{RedactionConfig, Redactor};

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the dispatch channel between publishers and the loop
    pub broadcast_capacity: usize,
    /// Default per-client outbound queue capacity
    pub client_outbound_capacity: usize,
    /// How often coalesced drop records are persisted
    pub coalesce_window: Duration,
    /// Replay page size
    pub replay_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            client_outbound_capacity: 256,
            coalesce_window: Duration::from_millis(250),
            replay_limit: 1000,
        }
    }
}

/// Hub-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub clients: usize,
    /// Events that never reached the loop because the dispatch channel was full
    pub global_dropped: u64,
    pub published: u64,
    pub redaction_enabled: bool,
    pub client_stats: Vec<ClientStats>,
}

enum Dispatch {
    Event(Arc<StoredEvent>),
    /// Resolves after everything queued before it was fanned out
    Barrier(oneshot::Sender<()>),
}

enum Command {
    Register {
        options: ClientOptions,
        reply: oneshot::Sender<Result<ClientRegistration, HubError>>,
    },
    Subscribe {
        id: String,
        topics: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, HubError>>,
    },
    Unsubscribe {
        id: String,
        topics: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, HubError>>,
    },
    Subscriptions {
        id: String,
        reply: oneshot::Sender<Result<Vec<String>, HubError>>,
    },
    ResetSubscriptions {
        id: String,
        reply: oneshot::Sender<Result<Vec<String>, HubError>>,
    },
    Stats {
        reply: oneshot::Sender<Vec<ClientStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// State shared between handles and the loop
struct Shared {
    store: Arc<EventStore>,
    config: HubConfig,
    publish_lock: Mutex<()>,
    redactor: RwLock<Option<Arc<Redactor>>>,
    global_dropped: AtomicU64,
    published: AtomicU64,
}

/// Cloneable entry point to the hub
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<Shared>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    command_tx: mpsc::Sender<Command>,
    unregister_tx: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("config", &self.shared.config)
            .finish()
    }
}

/// The supervisor loop state
pub struct Hub {
    shared: Arc<Shared>,
    clients: HashMap<String, ClientEntry>,
    ledger: DropLedger,
}

impl Hub {
    /// Start the hub loop on the current runtime
    pub fn spawn(store: Arc<EventStore>, config: HubConfig) -> HubHandle {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            store,
            config,
            publish_lock: Mutex::new(()),
            redactor: RwLock::new(None),
            global_dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
        });

        let hub = Hub {
            shared: shared.clone(),
            clients: HashMap::new(),
            ledger: DropLedger::new(1024),
        };
        tokio::spawn(hub.run(dispatch_rx, command_rx, unregister_rx));

        HubHandle {
            shared,
            dispatch_tx,
            command_tx,
            unregister_tx,
        }
    }

    async fn run(
        mut self,
        mut dispatch_rx: mpsc::Receiver<Dispatch>,
        mut command_rx: mpsc::Receiver<Command>,
        mut unregister_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let window = self.shared.config.coalesce_window.max(Duration::from_millis(1));
        let mut tick = tokio::time::interval(window);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("hub started");
        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    if let Some(reply) = self.handle_command(cmd) {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                }
                Some(id) = unregister_rx.recv() => {
                    self.unregister(&id);
                }
                msg = dispatch_rx.recv() => match msg {
                    Some(Dispatch::Event(event)) => self.fan_out(&event),
                    Some(Dispatch::Barrier(ack)) => {
                        self.flush_notices();
                        self.persist_drops();
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    self.flush_notices();
                    self.persist_drops();
                }
            }
        }
        self.shutdown();
    }

    /// Returns the shutdown ack when the loop must stop
    fn handle_command(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Register { options, reply } => {
                let _ = reply.send(self.register(options));
            }
            Command::Subscribe { id, topics, reply } => {
                let result = self.with_client(&id, |client| client.subscribe(topics));
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id, topics, reply } => {
                let result = self.with_client(&id, |client| client.unsubscribe(&topics));
                let _ = reply.send(result);
            }
            Command::Subscriptions { id, reply } => {
                let _ = reply.send(self.with_client(&id, |client| client.subscriptions()));
            }
            Command::ResetSubscriptions { id, reply } => {
                let _ = reply.send(self.with_client(&id, |client| client.reset()));
            }
            Command::Stats { reply } => {
                let mut stats: Vec<ClientStats> =
                    self.clients.values().map(|c| c.stats()).collect();
                stats.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
                let _ = reply.send(stats);
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn with_client<T>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut ClientEntry) -> T,
    ) -> Result<T, HubError> {
        self.clients
            .get_mut(id)
            .map(f)
            .ok_or_else(|| HubError::UnknownClient(id.to_string()))
    }

    fn register(&mut self, options: ClientOptions) -> Result<ClientRegistration, HubError> {
        for pattern in &options.subscriptions {
            validate_pattern(pattern)?;
        }

        let capacity = options
            .outbound_capacity
            .unwrap_or(self.shared.config.client_outbound_capacity)
            .max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let id = uuid::Uuid::new_v4().to_string();

        self.clients.insert(
            id.clone(),
            ClientEntry::new(id.clone(), options.transport.clone(), tx, options.subscriptions),
        );
        debug!(client_id = %id, transport = %options.transport, capacity, "client registered");

        Ok(ClientRegistration {
            id,
            outbound: rx,
            current_seq: self.shared.store.current_seq(),
        })
    }

    fn unregister(&mut self, id: &str) {
        if self.clients.remove(id).is_some() {
            debug!(client_id = %id, "client unregistered");
        }
    }

    fn fan_out(&mut self, event: &Arc<StoredEvent>) {
        if !self.clients.values().any(|c| c.is_subscribed(&event.topic)) {
            return;
        }

        let redactor = self.shared.redactor.read().clone();
        let text: Arc<str> = match render_event(event, redactor.as_deref()) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(seq = event.seq, topic = %event.topic, error = %e, "event skipped, payload not serializable");
                return;
            }
        };

        let now = Utc::now();
        let mut gone = Vec::new();
        let mut flush_early = false;
        for (id, client) in self.clients.iter_mut() {
            if !client.is_subscribed(&event.topic) {
                continue;
            }
            match client.deliver(event.seq, &event.topic, &text, now) {
                Delivery::Delivered => {}
                Delivery::Dropped => {
                    flush_early |=
                        self.ledger
                            .record(id, &event.topic, DropReason::BufferFull, event.seq);
                }
                Delivery::Closed => gone.push(id.clone()),
            }
        }

        for id in gone {
            self.clients.remove(&id);
            self.ledger
                .record(&id, &event.topic, DropReason::ClientGone, event.seq);
            warn!(client_id = %id, seq = event.seq, "client outbound closed, evicted");
        }
        if flush_early {
            self.persist_drops();
        }
    }

    fn flush_notices(&mut self) {
        let now = Utc::now();
        let gone: Vec<String> = self
            .clients
            .iter_mut()
            .filter_map(|(id, client)| (!client.flush_notices(now)).then(|| id.clone()))
            .collect();
        for id in gone {
            self.clients.remove(&id);
            warn!(client_id = %id, "client outbound closed, evicted");
        }
    }

    fn persist_drops(&mut self) {
        if self.ledger.is_empty() {
            return;
        }
        for (key, run) in self.ledger.drain() {
            debug!(
                client_id = %key.client_id,
                topic = %key.topic,
                reason = %key.reason,
                dropped_count = run.count,
                "drop run recorded"
            );
            self.shared.store.record_dropped_count(
                &key.client_id,
                &key.topic,
                key.reason,
                run.count,
                run.first_seq,
                run.last_seq,
            );
        }
    }

    fn shutdown(&mut self) {
        self.persist_drops();
        let count = self.clients.len();
        // Dropping the entries closes every outbound queue
        self.clients.clear();
        info!(clients = count, "hub stopped");
    }
}

impl HubHandle {
    pub fn store(&self) -> &Arc<EventStore> {
        &self.shared.store
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Publish through the store and hand the event to the loop
    ///
    /// Never waits on subscribers. When the dispatch channel is full the
    /// event is still stored (and replayable) but not fanned out live.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<Arc<StoredEvent>, StoreError> {
        // Keeps dispatch order identical to seq order across publishers
        let _guard = self.shared.publish_lock.lock();
        let event = self.shared.store.publish(topic, event_type, payload)?;
        self.shared.published.fetch_add(1, Ordering::Relaxed);

        match self.dispatch_tx.try_send(Dispatch::Event(event.clone())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.global_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(seq = event.seq, topic = %event.topic, "hub dispatch channel full, event not fanned out");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(seq = event.seq, "hub stopped, event stored only");
            }
        }
        Ok(event)
    }

    pub async fn register(&self, options: ClientOptions) -> Result<ClientRegistration, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Register { options, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Remove a client. Safe to call from `Drop`.
    pub fn unregister(&self, client_id: &str) {
        let _ = self.unregister_tx.send(client_id.to_string());
    }

    /// Add patterns; returns the full subscription set
    pub async fn subscribe(&self, client_id: &str, topics: Vec<String>) -> Result<Vec<String>, HubError> {
        for pattern in &topics {
            validate_pattern(pattern)?;
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            id: client_id.to_string(),
            topics,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Remove patterns; returns the remaining subscription set
    pub async fn unsubscribe(&self, client_id: &str, topics: Vec<String>) -> Result<Vec<String>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Unsubscribe {
            id: client_id.to_string(),
            topics,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    pub async fn subscriptions(&self, client_id: &str) -> Result<Vec<String>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscriptions {
            id: client_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Clear every subscription; returns what was removed
    pub async fn reset_subscriptions(&self, client_id: &str) -> Result<Vec<String>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ResetSubscriptions {
            id: client_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Wait until every event published before this call has been offered
    /// to clients and all coalesced drop records have been handed to the store
    pub async fn flush(&self) -> Result<(), HubError> {
        let (ack, rx) = oneshot::channel();
        self.dispatch_tx
            .send(Dispatch::Barrier(ack))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stats { reply }).await?;
        let client_stats = rx.await.map_err(|_| HubError::Closed)?;
        Ok(HubStats {
            clients: client_stats.len(),
            global_dropped: self.shared.global_dropped.load(Ordering::Relaxed),
            published: self.shared.published.load(Ordering::Relaxed),
            redaction_enabled: self.shared.redactor.read().is_some(),
            client_stats,
        })
    }

    /// Swap the redaction settings; takes effect for the next event
    pub fn set_redaction(&self, config: &RedactionConfig) -> Result<(), regex::Error> {
        let redactor = if config.enabled {
            Some(Arc::new(Redactor::from_config(config)?))
        } else {
            None
        };
        *self.shared.redactor.write() = redactor;
        info!(enabled = config.enabled, "redaction updated");
        Ok(())
    }

    /// Serialize an event the way live subscribers see it
    pub fn render(&self, event: &StoredEvent) -> Option<Arc<str>> {
        let redactor = self.shared.redactor.read().clone();
        match render_event(event, redactor.as_deref()) {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                warn!(seq = event.seq, error = %e, "event skipped, payload not serializable");
                None
            }
        }
    }

    /// Stop the loop: persist pending drops and close every client queue
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn command(&self, cmd: Command) -> Result<(), HubError> {
        self.command_tx.send(cmd).await.map_err(|_| HubError::Closed)
    }
}

impl EventSink for HubHandle {
    fn publish_value(
        &self,
        topic: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Arc<StoredEvent>, StoreError> {
        self.publish(topic, event_type, &payload)
    }
}
