//! WebSocket transport
//!
//! `GET /ws?topics=a,b&since=N` registers the connection as a hub client.
//! Clients send `subscribe`, `unsubscribe`, `resume` and `ping` control
//! frames and receive event envelopes plus hub notices.

pub mod handler;
pub mod state;

pub use handler::ws_handler;
pub use state::AppState;
