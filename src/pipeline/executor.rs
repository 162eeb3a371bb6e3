//! Pipeline executor
//!
//! Each run is one task. The executor persists [`ExecutionState`] before the
//! first step and after every step, and publishes progress on
//! `pipelines:<run_id>`. No lock is held while a step runs.
//!
//! # Run lifecycle
//!
//! ```text
//! start/resume ──► running ──► step ok ──► ... ──► succeeded
//!                     │           │
//!                     │           └─ step failed ──► failed (on_failure: fail)
//!                     └─ cancel ──► cancelled (current_step = interrupted step)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::error::{PipelineError, StepError};
use crate::event_store::EventSink;
use crate::utils::{system_clock, Clock};

use super::runner::{StepRequest, StepRunner};
use super::state::{ExecutionState, RunStatus, StateStore, StepResult, StepStatus};
use super::validate::validate;
use super::workflow::{substitute, OnFailure, Step, Workflow};

/// Parameters for a new run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub workflow: Workflow,
    /// Source file, recorded so the run can be resumed; `None` for inline workflows
    pub workflow_file: Option<String>,
    pub session: String,
    /// Overrides on top of the workflow's declared defaults
    pub variables: BTreeMap<String, Value>,
    /// External cancellation; the run also gets its own handle
    pub cancel: Option<CancelToken>,
}

/// Parameters for resuming a stopped run
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// Replaces the persisted session when set
    pub session: Option<String>,
    /// Merged over the persisted variables
    pub variables: BTreeMap<String, Value>,
    pub cancel: Option<CancelToken>,
}

struct ActiveRun {
    cancel: CancelHandle,
    done: watch::Receiver<Option<ExecutionState>>,
}

pub struct PipelineExecutor {
    states: StateStore,
    workflow_dir: PathBuf,
    runner: Arc<dyn StepRunner>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl PipelineExecutor {
    pub fn new(
        states: StateStore,
        workflow_dir: impl Into<PathBuf>,
        runner: Arc<dyn StepRunner>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            states,
            workflow_dir: workflow_dir.into(),
            runner,
            events,
            clock: system_clock(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Read a workflow file; relative paths resolve against the workflow directory
    pub fn load_workflow(&self, file: &str) -> Result<Workflow, PipelineError> {
        let path = Path::new(file);
        if path.is_absolute() {
            Workflow::load(path)
        } else {
            Workflow::load(&self.workflow_dir.join(path))
        }
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active.lock().contains_key(run_id)
    }

    /// Run in the foreground and return the final state
    pub async fn run(self: &Arc<Self>, request: RunRequest) -> Result<ExecutionState, PipelineError> {
        let state = self.start(request)?;
        self.wait(&state.run_id).await
    }

    /// Start a run in the background and return its initial state
    pub fn start(self: &Arc<Self>, request: RunRequest) -> Result<ExecutionState, PipelineError> {
        let report = validate(&request.workflow);
        if !report.valid {
            return Err(PipelineError::InvalidWorkflow {
                errors: report.errors,
            });
        }
        let session = request.session.trim().to_string();
        if session.is_empty() {
            return Err(PipelineError::MissingSession);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let mut variables = request.workflow.vars.clone();
        variables.extend(request.variables);
        variables.insert("session".to_string(), json!(session));
        variables.insert("run_id".to_string(), json!(run_id));

        let state = ExecutionState {
            run_id: run_id.clone(),
            workflow_id: request.workflow.id().to_string(),
            workflow_file: request.workflow_file.unwrap_or_default(),
            session,
            status: RunStatus::Running,
            current_step: 0,
            steps: Vec::new(),
            variables,
            started_at: self.clock.now(),
            finished_at: None,
            error: None,
        };

        self.launch(request.workflow, state.clone(), request.cancel, false)?;
        Ok(state)
    }

    /// Continue a stopped run from its `current_step`
    ///
    /// Failed, cancelled and stale (not active after a restart) runs can be
    /// resumed. Completed steps are not executed again.
    pub fn resume(
        self: &Arc<Self>,
        run_id: &str,
        request: ResumeRequest,
    ) -> Result<ExecutionState, PipelineError> {
        let mut state = self.states.load(run_id)?;
        if self.is_active(run_id) {
            return Err(PipelineError::AlreadyRunning(run_id.to_string()));
        }
        if state.status == RunStatus::Succeeded {
            return Err(PipelineError::NotResumable {
                run_id: run_id.to_string(),
                status: state.status.to_string(),
            });
        }
        if state.workflow_file.is_empty() {
            return Err(PipelineError::NoResumableState(run_id.to_string()));
        }

        let workflow = self.load_workflow(&state.workflow_file)?;
        let report = validate(&workflow);
        if !report.valid {
            return Err(PipelineError::InvalidWorkflow {
                errors: report.errors,
            });
        }

        let session = request
            .session
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| state.session.clone());
        if session.is_empty() {
            return Err(PipelineError::MissingSession);
        }

        state.variables.extend(request.variables);
        state
            .variables
            .insert("session".to_string(), json!(session));
        state.session = session;
        state.status = RunStatus::Running;
        state.finished_at = None;
        state.error = None;

        self.launch(workflow, state.clone(), request.cancel, true)?;
        Ok(state)
    }

    /// Cancel a run
    ///
    /// Idempotent for cancelled runs. An active run is signalled and the
    /// call waits for it to stop; a stale one is marked cancelled directly.
    pub async fn cancel(&self, run_id: &str) -> Result<ExecutionState, PipelineError> {
        let handle = self.active.lock().get(run_id).map(|r| r.cancel.clone());
        if let Some(handle) = handle {
            if handle.cancel() {
                info!(run_id, "pipeline cancellation requested");
            }
            return self.wait(run_id).await;
        }

        let state = self.states.load(run_id)?;
        match state.status {
            RunStatus::Cancelled => Ok(state),
            RunStatus::Succeeded | RunStatus::Failed => Err(PipelineError::NotCancellable {
                run_id: run_id.to_string(),
                status: state.status.to_string(),
            }),
            RunStatus::Pending | RunStatus::Running => {
                debug!(run_id, "cancelling run with no active worker");
                Ok(self.finish(state, RunStatus::Cancelled, None))
            }
        }
    }

    /// Latest persisted state
    pub fn status(&self, run_id: &str) -> Result<ExecutionState, PipelineError> {
        self.states.load(run_id)
    }

    pub fn list(&self) -> Result<Vec<ExecutionState>, PipelineError> {
        self.states.list()
    }

    /// Wait for an active run to stop; returns the persisted state otherwise
    pub async fn wait(&self, run_id: &str) -> Result<ExecutionState, PipelineError> {
        let done = self.active.lock().get(run_id).map(|r| r.done.clone());
        if let Some(mut done) = done {
            loop {
                let current = done.borrow_and_update().clone();
                if let Some(state) = current {
                    return Ok(state);
                }
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.states.load(run_id)
    }

    fn launch(
        self: &Arc<Self>,
        workflow: Workflow,
        state: ExecutionState,
        external: Option<CancelToken>,
        resumed: bool,
    ) -> Result<(), PipelineError> {
        let run_id = state.run_id.clone();
        let (handle, token) = match external {
            Some(parent) => parent.child(),
            None => cancel_pair(),
        };
        let (done_tx, done_rx) = watch::channel(None);

        {
            let mut active = self.active.lock();
            if active.contains_key(&run_id) {
                return Err(PipelineError::AlreadyRunning(run_id));
            }
            active.insert(
                run_id.clone(),
                ActiveRun {
                    cancel: handle,
                    done: done_rx,
                },
            );
        }

        if let Err(e) = self.states.save(&state) {
            self.active.lock().remove(&run_id);
            return Err(e);
        }

        info!(
            run_id = %run_id,
            workflow_id = %state.workflow_id,
            from_step = state.current_step,
            resumed,
            "pipeline started"
        );
        self.emit(
            &state,
            "pipeline.started",
            json!({
                "run_id": run_id,
                "workflow_id": state.workflow_id,
                "session": state.session,
                "from_step": state.current_step,
                "step_count": workflow.steps.len(),
                "resumed": resumed,
            }),
        );

        let executor = self.clone();
        tokio::spawn(async move {
            let final_state = executor.execute(&workflow, state, token).await;
            executor.active.lock().remove(&run_id);
            done_tx.send_replace(Some(final_state));
        });
        Ok(())
    }

    async fn execute(
        &self,
        workflow: &Workflow,
        mut state: ExecutionState,
        cancel: CancelToken,
    ) -> ExecutionState {
        while let Some(step) = workflow.steps.get(state.current_step) {
            if cancel.is_cancelled() {
                return self.finish(state, RunStatus::Cancelled, None);
            }

            let index = state.current_step;
            let request = StepRequest {
                run_id: state.run_id.clone(),
                session: state.session.clone(),
                step_id: step.id.clone(),
                command: step.command.as_deref().map(|c| substitute(c, &state.variables)),
                prompt: step.prompt.as_deref().map(|p| substitute(p, &state.variables)),
                agent: step.agent.clone(),
            };
            let started_at = self.clock.now();

            let outcome = tokio::select! {
                result = self.run_step(step, request) => result,
                _ = cancel.cancelled() => {
                    info!(run_id = %state.run_id, step_id = %step.id, "step interrupted by cancellation");
                    return self.finish(state, RunStatus::Cancelled, None);
                }
            };
            let finished_at = self.clock.now();

            match outcome {
                Ok(output) => {
                    if let Some(var) = &step.output_var {
                        state
                            .variables
                            .insert(var.clone(), Value::String(output.clone()));
                    }
                    state.steps.push(StepResult {
                        step_id: step.id.clone(),
                        index,
                        status: StepStatus::Succeeded,
                        output: Some(output.clone()),
                        error: None,
                        started_at,
                        finished_at,
                    });
                    state.current_step += 1;
                    self.persist(&state);
                    self.emit(
                        &state,
                        "pipeline.step.completed",
                        json!({
                            "run_id": state.run_id,
                            "step_id": step.id,
                            "name": step.display_name(),
                            "index": index,
                            "output": output,
                        }),
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    state.steps.push(StepResult {
                        step_id: step.id.clone(),
                        index,
                        status: StepStatus::Failed,
                        output: None,
                        error: Some(message.clone()),
                        started_at,
                        finished_at,
                    });
                    self.emit(
                        &state,
                        "pipeline.step.failed",
                        json!({
                            "run_id": state.run_id,
                            "step_id": step.id,
                            "name": step.display_name(),
                            "index": index,
                            "error": message,
                            "continue": step.on_failure == OnFailure::Continue,
                        }),
                    );

                    match step.on_failure {
                        OnFailure::Continue => {
                            warn!(run_id = %state.run_id, step_id = %step.id, error = %message, "step failed, continuing");
                            state.current_step += 1;
                            self.persist(&state);
                        }
                        OnFailure::Fail => {
                            let error = format!("step '{}' failed: {}", step.id, message);
                            return self.finish(state, RunStatus::Failed, Some(error));
                        }
                    }
                }
            }
        }

        self.finish(state, RunStatus::Succeeded, None)
    }

    async fn run_step(&self, step: &Step, request: StepRequest) -> Result<String, StepError> {
        match step.timeout {
            Some(limit) => tokio::time::timeout(limit, self.runner.run(request))
                .await
                .unwrap_or(Err(StepError::Timeout(limit))),
            None => self.runner.run(request).await,
        }
    }

    fn finish(
        &self,
        mut state: ExecutionState,
        status: RunStatus,
        error: Option<String>,
    ) -> ExecutionState {
        state.status = status;
        state.finished_at = Some(self.clock.now());
        state.error = error;
        self.persist(&state);

        match status {
            RunStatus::Failed => warn!(
                run_id = %state.run_id,
                error = state.error.as_deref().unwrap_or(""),
                "pipeline failed"
            ),
            _ => info!(run_id = %state.run_id, status = %status, current_step = state.current_step, "pipeline finished"),
        }

        match serde_json::to_value(&state) {
            Ok(payload) => self.emit(&state, &format!("pipeline.{}", status), payload),
            Err(e) => warn!(run_id = %state.run_id, error = %e, "pipeline state not serializable"),
        }
        state
    }

    fn persist(&self, state: &ExecutionState) {
        if let Err(e) = self.states.save(state) {
            error!(run_id = %state.run_id, error = %e, "failed to persist pipeline state");
        }
    }

    fn emit(&self, state: &ExecutionState, event_type: &str, payload: Value) {
        if let Err(e) = self.events.publish_value(&state.topic(), event_type, payload) {
            warn!(run_id = %state.run_id, error = %e, "failed to publish pipeline event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::event_store::{EventStore, EventStoreConfig};

    /// Echoes the command; `fail` fails, `sleep` never finishes
    struct EchoRunner;

    #[async_trait]
    impl StepRunner for EchoRunner {
        async fn run(&self, request: StepRequest) -> Result<String, StepError> {
            match request.command.as_deref() {
                Some("fail") => Err(StepError::Other("boom".to_string())),
                Some("sleep") => {
                    std::future::pending::<()>().await;
                    Ok(String::new())
                }
                Some(cmd) => Ok(cmd.to_string()),
                None => Err(StepError::Unsupported(request.step_id)),
            }
        }
    }

    fn step(id: &str, command: &str) -> Step {
        Step {
            id: id.to_string(),
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "wf".to_string(),
            steps,
            ..Default::default()
        }
    }

    fn executor(dir: &TempDir) -> (Arc<PipelineExecutor>, Arc<EventStore>) {
        let events = Arc::new(EventStore::memory_only(EventStoreConfig::default()));
        let states = StateStore::open(dir.path().join("pipelines")).unwrap();
        let exec = PipelineExecutor::new(states, dir.path(), Arc::new(EchoRunner), events.clone());
        (Arc::new(exec), events)
    }

    fn request(wf: Workflow) -> RunRequest {
        RunRequest {
            workflow: wf,
            session: "s1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_substitutes_and_chains_outputs() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir);
        let mut first = step("a", "hello ${session}");
        first.output_var = Some("greeting".to_string());
        let wf = workflow(vec![first, step("b", "${greeting}!")]);

        let state = exec.run(request(wf)).await.unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.current_step, 2);
        assert_eq!(state.steps[1].output.as_deref(), Some("hello s1!"));
        assert_eq!(exec.status(&state.run_id).unwrap(), state);
    }

    #[tokio::test]
    async fn test_failure_policy() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir);

        let mut tolerant = step("a", "fail");
        tolerant.on_failure = OnFailure::Continue;
        let state = exec
            .run(request(workflow(vec![tolerant, step("b", "ok")])))
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.steps[0].status, StepStatus::Failed);

        let state = exec
            .run(request(workflow(vec![step("a", "ok"), step("b", "fail"), step("c", "ok")])))
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.current_step, 1);
        assert!(state.error.unwrap().contains("step 'b' failed"));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir);
        let mut slow = step("a", "sleep");
        slow.timeout = Some(Duration::from_millis(20));
        let state = exec.run(request(workflow(vec![slow]))).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir);
        assert!(matches!(
            exec.start(request(workflow(vec![]))),
            Err(PipelineError::InvalidWorkflow { .. })
        ));
        let mut req = request(workflow(vec![step("a", "ok")]));
        req.session = "  ".to_string();
        assert!(matches!(exec.start(req), Err(PipelineError::MissingSession)));
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let dir = TempDir::new().unwrap();
        let (exec, events) = executor(&dir);

        let state = exec.start(request(workflow(vec![step("a", "sleep")]))).unwrap();
        let cancelled = exec.cancel(&state.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        // idempotent
        assert_eq!(exec.cancel(&state.run_id).await.unwrap().status, RunStatus::Cancelled);

        let replay = events.get_since(0, &state.topic(), 0).await.unwrap();
        assert!(replay.events.iter().any(|e| e.event_type == "pipeline.cancelled"));

        let done = exec.run(request(workflow(vec![step("a", "ok")]))).await.unwrap();
        assert!(matches!(
            exec.cancel(&done.run_id).await,
            Err(PipelineError::NotCancellable { .. })
        ));
        assert!(matches!(exec.cancel("missing").await, Err(PipelineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inline_workflow_cannot_resume() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir);
        let state = exec
            .run(request(workflow(vec![step("a", "fail")])))
            .await
            .unwrap();
        assert!(matches!(
            exec.resume(&state.run_id, ResumeRequest::default()),
            Err(PipelineError::NoResumableState(_))
        ));
    }
}
