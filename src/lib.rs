//! Streamhub
//!
//! The event backbone of a control plane: every state change is published
//! once, sequenced, kept in a bounded in-memory window plus an optional
//! SQLite log, and fanned out to WebSocket and SSE subscribers by topic.
//! Background jobs and workflow pipelines report progress through the same
//! stream.
//!
//! # Features
//!
//! - **Gap-free sequencing**: every event gets a unique, increasing `seq`
//! - **Replay**: clients resume from a cursor, or get an explicit reset
//! - **Bounded fan-out**: slow subscribers lose events, never stall others,
//!   and every loss is recorded
//! - **Jobs**: `cleanup` and `export` maintenance tasks
//! - **Pipelines**: YAML workflows with persisted, resumable runs
//!
//! # Modules
//!
//! - `types`: event, drop record and job records
//! - `topic`: glob-style topic matching
//! - `event_store`: sequencer, ring buffer, SQLite log, retention
//! - `hub`: fan-out loop, drop accounting, wire frames, redaction, replay
//! - `jobs`: job store and built-in handlers
//! - `pipeline`: workflows, validation, execution state, executor
//! - `api`: axum router, WebSocket and SSE transports, REST handlers
//! - `config`: layered server configuration
//! - `server`: component wiring and lifecycle
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamhub::event_store::{EventStore, EventStoreConfig};
//! use streamhub::hub::{ClientOptions, Hub, HubConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(EventStore::memory_only(EventStoreConfig::default()));
//! let hub = Hub::spawn(store, HubConfig::default());
//!
//! let mut client = hub.register(ClientOptions::new("demo").subscribe(["panes:*"])).await?;
//! hub.publish("panes:1", "pane.output", &serde_json::json!({"text": "hi"}))?;
//! let frame = client.outbound.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cancel;
pub mod config;
pub mod error;
pub mod event_store;
pub mod hub;
pub mod jobs;
pub mod pipeline;
pub mod server;
pub mod telemetry;
pub mod topic;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::ServerConfig;
pub use error::{ConfigError, HubError, JobError, PipelineError, ServeError, StoreError};
pub use event_store::{EventSink, EventStore, EventStoreConfig};
pub use hub::{Hub, HubConfig, HubHandle};
pub use server::Server;
pub use types::{DropReason, DroppedEventRecord, Job, JobStatus, JobType, StoredEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
