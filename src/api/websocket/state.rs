//! Shared application state for HTTP, SSE and WebSocket handlers

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::event_store::EventStore;
use crate::hub::HubHandle;
use crate::jobs::JobStore;
use crate::pipeline::PipelineExecutor;

/// Everything a request handler can reach
pub struct AppState {
    pub hub: HubHandle,
    pub jobs: Arc<JobStore>,
    pub pipelines: Arc<PipelineExecutor>,
    /// Streaming clients silent for longer than this are evicted
    pub idle_timeout: Duration,
    /// Fires on server shutdown so long-lived streams end
    pub shutdown: CancelToken,
}

impl AppState {
    pub fn new(hub: HubHandle, jobs: Arc<JobStore>, pipelines: Arc<PipelineExecutor>) -> Self {
        Self {
            hub,
            jobs,
            pipelines,
            idle_timeout: Duration::from_secs(60),
            shutdown: CancelToken::never(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancelToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Arc<EventStore> {
        self.hub.store()
    }

    /// Highest assigned seq
    pub fn current_seq(&self) -> i64 {
        self.store().current_seq()
    }

    /// Keep-alive period for streaming transports
    pub fn keepalive_interval(&self) -> Duration {
        (self.idle_timeout / 2).max(Duration::from_millis(100))
    }
}
