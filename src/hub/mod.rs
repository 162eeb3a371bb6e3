//! Fan-out hub
//!
//! Delivers sequenced events from the [`crate::event_store::EventStore`] to
//! streaming clients. Slow clients lose events (accounted and announced),
//! they never slow down publishers or other clients.

mod broadcaster;
mod client;
mod frames;
mod ledger;
mod redact;
mod replay;

pub use broadcaster::{Hub, HubConfig, HubHandle, HubStats};
pub use client::{ClientOptions, ClientRegistration, ClientStats, OutboundFrame};
pub use frames::{render_event, ClientMessage, DropNotice, EventEnvelope, ResetNotice, ServerMessage};
pub use ledger::{DropKey, DropLedger, DropRun};
pub use redact::{RedactionConfig, Redactor};
pub use replay::{ReplayItem, ReplayStream};
