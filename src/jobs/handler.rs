//! Job handlers
//!
//! A handler implements one [`JobType`]. The job store owns the lifecycle;
//! handlers only do the work and report an optional JSON result.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::HandlerError;
use crate::event_store::EventStore;
use crate::topic::TopicFilter;
use crate::types::JobType;
use crate::utils::atomic_write_with;

/// Everything a handler gets for one run
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: JobType,
    pub opts: Map<String, Value>,
    /// Fires when the job is cancelled; long-running handlers should watch it
    pub cancel: CancelToken,
}

/// Trait for job workers
///
/// One handler per [`JobType`]; the store rejects types without one.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, ctx: JobContext) -> Result<Option<Value>, HandlerError>;
}

/// `cleanup`: apply event log retention now
pub struct CleanupHandler {
    store: Arc<EventStore>,
}

impl CleanupHandler {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    fn job_type(&self) -> JobType {
        JobType::Cleanup
    }

    async fn run(&self, ctx: JobContext) -> Result<Option<Value>, HandlerError> {
        let report = self.store.prune().await?;
        debug!(job_id = %ctx.job_id, "cleanup finished");
        Ok(Some(match report {
            Some(r) => json!({
                "persistent": true,
                "events_deleted": r.events_deleted,
                "dropped_deleted": r.dropped_deleted,
            }),
            None => json!({ "persistent": false }),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ExportOptions {
    since: i64,
    topic: String,
    /// Upper bound on exported events; 0 means everything available
    limit: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            since: 0,
            topic: "*".to_string(),
            limit: 0,
        }
    }
}

/// `export`: write events after a cursor to `<dir>/export-<job id>.jsonl`
pub struct ExportHandler {
    store: Arc<EventStore>,
    dir: PathBuf,
}

impl ExportHandler {
    pub fn new(store: Arc<EventStore>, dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    fn job_type(&self) -> JobType {
        JobType::Export
    }

    async fn run(&self, ctx: JobContext) -> Result<Option<Value>, HandlerError> {
        let opts: ExportOptions = serde_json::from_value(Value::Object(ctx.opts.clone()))
            .map_err(|e| HandlerError::new(format!("invalid export options: {}", e)))?;
        let filter = TopicFilter::single(opts.topic.clone());
        let page_size = self.store.config().default_limit.max(1);

        let mut lines = Vec::new();
        let mut cursor = opts.since;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::new("cancelled"));
            }
            let page = self.store.get_since_matching(cursor, &filter, page_size).await?;
            if page.needs_reset {
                return Err(HandlerError::new(format!(
                    "cursor {} is older than the retained events",
                    opts.since
                )));
            }
            let fetched = page.events.len();
            for event in page.events {
                cursor = event.seq;
                lines.push(serde_json::to_string(event.as_ref()).map_err(|e| HandlerError::new(e.to_string()))?);
                if opts.limit > 0 && lines.len() == opts.limit {
                    break;
                }
            }
            if fetched < page_size || (opts.limit > 0 && lines.len() >= opts.limit) {
                break;
            }
        }

        let path = self.dir.join(format!("export-{}.jsonl", ctx.job_id));
        let count = lines.len();
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            atomic_write_with(&target, |w| {
                for line in &lines {
                    writeln!(w, "{}", line)?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| HandlerError::new(e.to_string()))?
        .map_err(|e| HandlerError::new(e.to_string()))?;

        info!(job_id = %ctx.job_id, events = count, path = %path.display(), "export written");
        Ok(Some(json!({
            "path": path.display().to_string(),
            "events": count,
            "last_seq": cursor,
        })))
    }
}
