//! Background jobs
//!
//! Jobs are short-lived maintenance tasks (`cleanup`, `export`) created over
//! REST. Their lifecycle is published as events, so clients follow progress
//! by subscribing to `jobs:<id>`.

mod handler;
mod store;

use std::path::Path;
use std::sync::Arc;

use crate::event_store::EventStore;

pub use handler::{CleanupHandler, ExportHandler, JobContext, JobHandler};
pub use store::JobStore;

/// Register the built-in handlers
pub fn register_builtin_handlers(jobs: &mut JobStore, store: Arc<EventStore>, data_dir: &Path) {
    jobs.register_handler(Arc::new(CleanupHandler::new(store.clone())));
    jobs.register_handler(Arc::new(ExportHandler::new(store, data_dir.join("exports"))));
}
