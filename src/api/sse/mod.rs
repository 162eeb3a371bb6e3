//! Server-sent events transport
//!
//! `GET /events` replays the event log as an SSE stream and optionally
//! follows live fan-out. Frames carry the same JSON as the WebSocket
//! transport; event envelopes also set the SSE `id` to their seq so
//! `Last-Event-ID` reconnects resume where they left off.

pub mod handler;

pub use handler::{events_handler, EventsParams};
