//! Server assembly and lifecycle
//!
//! Wires the event store, hub, job store and pipeline executor into one
//! [`Server`], serves the HTTP router, and tears everything down in order
//! on shutdown: stop accepting, end streams, stop pruning, drain the hub,
//! flush the log.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{create_router, AppState};
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::config::ServerConfig;
use crate::error::{ConfigError, ServeError, StoreError};
use crate::event_store::{spawn_prune_task, EventStore};
use crate::hub::Hub;
use crate::jobs::{register_builtin_handlers, JobStore};
use crate::pipeline::{CommandStepRunner, PipelineExecutor, StateStore};

/// Open the event store described by `config`
///
/// A log that cannot be opened degrades to memory-only unless
/// `require_event_log` is set.
pub fn open_store(config: &ServerConfig) -> Result<Arc<EventStore>, ServeError> {
    if !config.event_log {
        info!("event log disabled, running memory-only");
        return Ok(Arc::new(EventStore::memory_only(config.store_config())));
    }

    let path = config.event_log_path();
    let opened = std::fs::create_dir_all(&config.data_dir)
        .map_err(StoreError::from)
        .and_then(|()| EventStore::open(config.store_config(), &path));
    match opened {
        Ok(store) => {
            info!(path = %path.display(), "event log opened");
            Ok(Arc::new(store))
        }
        Err(e) if config.require_event_log => Err(ServeError::LogRequired(e)),
        Err(e) => {
            error!(path = %path.display(), error = %e, "event log unavailable, running memory-only");
            Ok(Arc::new(EventStore::memory_only(config.store_config())))
        }
    }
}

/// Ctrl-C / SIGTERM as a cancel token
pub fn install_signal_handler() -> Result<CancelToken, ServeError> {
    let (handle, token) = cancel_pair();
    ctrlc::set_handler(move || {
        if handle.cancel() {
            info!("shutdown signal received");
        }
    })?;
    Ok(token)
}

/// A fully wired server, not yet listening
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
    shutdown: CancelHandle,
    prune: JoinHandle<()>,
}

impl Server {
    /// Build every component. Must run inside a Tokio runtime.
    pub fn build(config: ServerConfig) -> Result<Self, ServeError> {
        let store = open_store(&config)?;

        let hub = Hub::spawn(store.clone(), config.hub_config());
        hub.set_redaction(&config.redaction)
            .map_err(|e| ConfigError::Invalid(format!("redaction pattern: {}", e)))?;

        let (shutdown, token) = cancel_pair();
        let prune = spawn_prune_task(store.clone(), config.cleanup_interval, token.clone());

        let mut jobs = JobStore::new(Arc::new(hub.clone()));
        register_builtin_handlers(&mut jobs, store, &config.data_dir);

        let states = StateStore::open(config.pipeline_state_dir())?;
        let pipelines = PipelineExecutor::new(
            states,
            config.workflow_dir.clone(),
            Arc::new(CommandStepRunner::new()),
            Arc::new(hub.clone()),
        );

        let state = AppState::new(hub, Arc::new(jobs), Arc::new(pipelines))
            .with_idle_timeout(config.idle_timeout)
            .with_shutdown(token);

        Ok(Self {
            config,
            state: Arc::new(state),
            shutdown,
            prune,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Bind `listen_addr` and serve until Ctrl-C / SIGTERM
    pub async fn serve(self) -> Result<(), ServeError> {
        let addr = self.config.listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })?;
        let signal = install_signal_handler()?;
        self.serve_on(listener, async move { signal.cancelled().await })
            .await
    }

    /// Serve on `listener` until `signal` completes
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            persistent = self.state.store().has_log(),
            version = crate::VERSION,
            "streamhub listening"
        );

        // Streaming handlers watch the same token, so open streams end too
        let shutdown = self.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                signal.await;
                shutdown.cancel();
            })
            .await;

        self.stop().await;
        result.map_err(ServeError::Io)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.prune.await {
            warn!(error = %e, "prune task ended abnormally");
        }
        self.state.hub.shutdown().await;
        if let Err(e) = self.state.store().flush().await {
            warn!(error = %e, "final event log flush failed");
        }
        info!("streamhub stopped");
    }
}
