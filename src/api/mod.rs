//! HTTP surface
//!
//! REST endpoints for jobs, pipelines and event introspection, plus the
//! WebSocket and SSE streaming transports.

pub mod http;
pub mod rest;
pub mod sse;
pub mod websocket;

pub use http::create_router;
pub use rest::{ApiError, ApiResponse};
pub use websocket::AppState;
