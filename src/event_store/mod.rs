//! Event Store Module
//!
//! This module provides the sequenced event backbone:
//! - `Sequencer`: monotonic `seq` assignment
//! - `RingBuffer`: bounded window of recent events
//! - `AppendLog`: durable SQLite log with a dedicated writer thread
//! - `EventStore`: publish/replay façade over the three
//! - `spawn_prune_task`: periodic retention
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//! ┌─────────┐    ┌───────────┐    ┌─────────────┐    ┌──────────────┐
//! │ publish │───►│ next seq  │───►│ ring buffer │───►│ writer queue │──► SQLite
//! └─────────┘    └───────────┘    └─────────────┘    └──────────────┘
//!
//! Read Path (replay):
//! ┌───────────────┐  covered?  ┌──────────┐
//! │ get_since(n)  │───────────►│   ring   │
//! └───────────────┘     no     └──────────┘
//!         │──────────► flush barrier ──► SQLite range (paged, filtered)
//! ```

mod log;
mod prune;
mod ring;
mod sequencer;
mod stats;
mod store;

pub use log::{AppendLog, LogStats, PruneReport, DEFAULT_QUEUE_CAPACITY};
pub use prune::spawn_prune_task;
pub use ring::RingBuffer;
pub use sequencer::Sequencer;
pub use stats::{BufferStats, StoreStats};
pub use store::{EventSink, EventStore, EventStoreConfig, Replay};
