//! In-memory job store
//!
//! Jobs live in a map guarded by a short `RwLock`. Every status change goes
//! through [`JobStore::transition`], which enforces the lifecycle graph and
//! publishes a `job.<status>` event on `jobs:<id>` while still holding the
//! write lock, so a job's events are sequenced in the order its status
//! changed. Sinks must not call back into the store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::error::JobError;
use crate::event_store::EventSink;
use crate::types::{Job, JobStatus, JobType};
use crate::utils::{system_clock, Clock};

use super::handler::{JobContext, JobHandler};

struct JobEntry {
    job: Job,
    cancel: CancelHandle,
}

enum Outcome {
    Succeeded(Option<Value>),
    Failed(String),
    Cancelled,
}

/// Job registry and scheduler
pub struct JobStore {
    jobs: RwLock<HashMap<String, JobEntry>>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            handlers: HashMap::new(),
            events,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register the handler for its job type, replacing any previous one
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    /// Job types that can currently be created
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .iter()
            .copied()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    /// Create a job in `pending` and schedule its worker
    pub fn create(
        self: &Arc<Self>,
        job_type: &str,
        opts: Map<String, Value>,
    ) -> Result<Job, JobError> {
        let job_type: JobType = job_type.parse().map_err(JobError::InvalidJobType)?;
        let handler = self
            .handlers
            .get(&job_type)
            .cloned()
            .ok_or_else(|| JobError::InvalidJobType(job_type.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), job_type, opts, self.clock.now());
        let (handle, token) = cancel_pair();

        {
            let mut jobs = self.jobs.write();
            jobs.insert(
                id.clone(),
                JobEntry {
                    job: job.clone(),
                    cancel: handle,
                },
            );
            self.emit(&job);
        }
        debug!(job_id = %id, job_type = %job_type, "job created");

        let store = self.clone();
        tokio::spawn(async move { store.run_job(id, handler, token).await });
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Job, JobError> {
        self.jobs
            .read()
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Cancel a job
    ///
    /// Idempotent: a terminal job is returned unchanged.
    pub fn cancel(&self, id: &str) -> Result<Job, JobError> {
        let (status, handle) = {
            let jobs = self.jobs.read();
            let entry = jobs
                .get(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            (entry.job.status, entry.cancel.clone())
        };
        if status.is_terminal() {
            return self.get(id);
        }

        let result = self.transition(id, JobStatus::Cancelled, |_| {});
        handle.cancel();
        match result {
            Ok(job) => Ok(job),
            // Finished between the check and the transition
            Err(JobError::InvalidTransition { .. }) => self.get(id),
            Err(e) => Err(e),
        }
    }

    /// Move a job along the lifecycle graph and publish the change
    fn transition(
        &self,
        id: &str,
        next: JobStatus,
        update: impl FnOnce(&mut Job),
    ) -> Result<Job, JobError> {
        let job = {
            let mut jobs = self.jobs.write();
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            let current = entry.job.status;
            if !current.can_transition_to(next) {
                return Err(JobError::InvalidTransition {
                    id: id.to_string(),
                    from: current,
                    to: next,
                });
            }

            let now = self.clock.now();
            let job = &mut entry.job;
            job.status = next;
            if next == JobStatus::Running {
                job.started_at = Some(now);
            }
            if next.is_terminal() {
                job.finished_at = Some(now);
            }
            update(job);
            let job = job.clone();
            self.emit(&job);
            job
        };

        if next.is_terminal() {
            info!(job_id = %job.id, job_type = %job.job_type, status = %next, "job finished");
        }
        Ok(job)
    }

    fn emit(&self, job: &Job) {
        let payload = match serde_json::to_value(job) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job event not serializable");
                return;
            }
        };
        let event_type = format!("job.{}", job.status);
        if let Err(e) = self.events.publish_value(&job.topic(), &event_type, payload) {
            warn!(job_id = %job.id, error = %e, "failed to publish job event");
        }
    }

    async fn run_job(self: Arc<Self>, id: String, handler: Arc<dyn JobHandler>, cancel: CancelToken) {
        let job = match self.transition(&id, JobStatus::Running, |_| {}) {
            Ok(job) => job,
            Err(e) => {
                debug!(job_id = %id, error = %e, "job not started");
                return;
            }
        };

        let ctx = JobContext {
            job_id: id.clone(),
            job_type: job.job_type,
            opts: job.opts,
            cancel: cancel.clone(),
        };
        // A panicking handler surfaces as a JoinError instead of killing the worker
        let task = tokio::spawn(async move { handler.run(ctx).await });
        let abort = task.abort_handle();

        let outcome = tokio::select! {
            joined = task => match joined {
                Ok(Ok(result)) => Outcome::Succeeded(result),
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(e) => Outcome::Failed(format!("job handler panicked: {}", e)),
            },
            _ = cancel.cancelled() => {
                abort.abort();
                Outcome::Cancelled
            }
        };

        let result = match outcome {
            Outcome::Succeeded(value) => {
                self.transition(&id, JobStatus::Succeeded, |job| job.result = value)
            }
            Outcome::Failed(error) => {
                self.transition(&id, JobStatus::Failed, |job| job.error = Some(error))
            }
            Outcome::Cancelled => self.transition(&id, JobStatus::Cancelled, |_| {}),
        };
        if let Err(e) = result {
            // Usually a cancel that already recorded the terminal state
            debug!(job_id = %id, error = %e, "job outcome not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::HandlerError;
    use crate::error::StoreError;
    use crate::event_store::{EventStore, EventStoreConfig};
    use crate::types::StoredEvent;

    struct Scripted {
        job_type: JobType,
        behaviour: &'static str,
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn job_type(&self) -> JobType {
            self.job_type
        }

        async fn run(&self, ctx: JobContext) -> Result<Option<Value>, HandlerError> {
            match self.behaviour {
                "ok" => Ok(Some(json!({ "done": true }))),
                "fail" => Err(HandlerError::new("disk full")),
                "panic" => panic!("boom"),
                _ => {
                    ctx.cancel.cancelled().await;
                    Ok(None)
                }
            }
        }
    }

    fn store(behaviour: &'static str) -> (Arc<JobStore>, Arc<EventStore>) {
        let events = Arc::new(EventStore::memory_only(EventStoreConfig::default()));
        let mut jobs = JobStore::new(events.clone());
        jobs.register_handler(Arc::new(Scripted {
            job_type: JobType::Cleanup,
            behaviour,
        }));
        (Arc::new(jobs), events)
    }

    async fn wait_for(jobs: &JobStore, id: &str, status: JobStatus) -> Job {
        for _ in 0..200 {
            let job = jobs.get(id).unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_unknown_or_unhandled_type_rejected() {
        let (jobs, _) = store("ok");
        assert!(matches!(
            jobs.create("reindex", Map::new()),
            Err(JobError::InvalidJobType(t)) if t == "reindex"
        ));
        // valid type but no handler registered
        assert!(matches!(
            jobs.create("export", Map::new()),
            Err(JobError::InvalidJobType(_))
        ));
        assert_eq!(jobs.job_types(), vec![JobType::Cleanup]);
    }

    #[tokio::test]
    async fn test_successful_job_emits_lifecycle_events() {
        let (jobs, events) = store("ok");
        let job = jobs.create("cleanup", Map::new()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = wait_for(&jobs, &job.id, JobStatus::Succeeded).await;
        assert_eq!(done.result, Some(json!({ "done": true })));
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());

        let replay = events.get_since(0, &job.topic(), 0).await.unwrap();
        let types: Vec<&str> = replay.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["job.pending", "job.running", "job.succeeded"]);
    }

    #[tokio::test]
    async fn test_failed_and_panicking_handlers() {
        let (jobs, _) = store("fail");
        let job = jobs.create("cleanup", Map::new()).unwrap();
        let failed = wait_for(&jobs, &job.id, JobStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("disk full"));

        let (jobs, _) = store("panic");
        let job = jobs.create("cleanup", Map::new()).unwrap();
        let failed = wait_for(&jobs, &job.id, JobStatus::Failed).await;
        assert!(failed.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (jobs, events) = store("block");
        let job = jobs.create("cleanup", Map::new()).unwrap();
        wait_for(&jobs, &job.id, JobStatus::Running).await;

        let cancelled = jobs.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        let again = jobs.cancel(&job.id).unwrap();
        assert_eq!(again, cancelled);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let replay = events.get_since(0, &job.topic(), 0).await.unwrap();
        let cancelled_events = replay
            .events
            .iter()
            .filter(|e| e.event_type == "job.cancelled")
            .count();
        assert_eq!(cancelled_events, 1);

        assert!(matches!(jobs.cancel("missing"), Err(JobError::NotFound(_))));
    }

    /// Sink that stalls before recording `job.running`
    struct SlowRunningSink {
        inner: Arc<EventStore>,
    }

    impl EventSink for SlowRunningSink {
        fn publish_value(
            &self,
            topic: &str,
            event_type: &str,
            payload: Value,
        ) -> Result<Arc<StoredEvent>, StoreError> {
            if event_type == "job.running" {
                std::thread::sleep(Duration::from_millis(200));
            }
            self.inner.publish_value(topic, event_type, payload)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_slow_publish_keeps_event_order() {
        let events = Arc::new(EventStore::memory_only(EventStoreConfig::default()));
        let mut jobs = JobStore::new(Arc::new(SlowRunningSink {
            inner: events.clone(),
        }));
        jobs.register_handler(Arc::new(Scripted {
            job_type: JobType::Cleanup,
            behaviour: "block",
        }));
        let jobs = Arc::new(jobs);

        let job = jobs.create("cleanup", Map::new()).unwrap();
        // the worker is now inside the running publish
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancelled = jobs.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        wait_for(&jobs, &job.id, JobStatus::Cancelled).await;

        let replay = events.get_since(0, &job.topic(), 0).await.unwrap();
        let types: Vec<&str> = replay.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["job.pending", "job.running", "job.cancelled"]);
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let (jobs, _) = store("ok");
        let a = jobs.create("cleanup", Map::new()).unwrap();
        let b = jobs.create("cleanup", Map::new()).unwrap();
        let ids: Vec<String> = jobs.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
    }
}
