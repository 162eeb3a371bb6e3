//! Pipeline endpoints

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ApiError, ApiResponse};
use crate::api::websocket::state::AppState;
use crate::pipeline::{validate, ExecutionState, ResumeRequest, RunRequest, ValidationReport, Workflow};

/// Body of `POST /pipelines/run`
#[derive(Debug, Deserialize)]
pub struct RunPipelineBody {
    pub workflow_file: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Validate only
    #[serde(default)]
    pub dry_run: bool,
    /// Return as soon as the run has started
    #[serde(default)]
    pub background: bool,
}

/// Body of `POST /pipelines/exec`
#[derive(Debug, Deserialize)]
pub struct ExecPipelineBody {
    /// YAML text or an already-structured workflow object
    pub workflow: Value,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub background: bool,
}

/// Body of `POST /pipelines/validate`
#[derive(Debug, Default, Deserialize)]
pub struct ValidateBody {
    pub workflow_file: Option<String>,
    pub workflow: Option<Value>,
}

/// Optional body of `POST /pipelines/:id/resume`
#[derive(Debug, Default, Deserialize)]
pub struct ResumeBody {
    pub session: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub validation: ValidationReport,
    /// Absent for dry runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<ExecutionState>,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub run: ExecutionState,
}

fn parse_inline(workflow: Value) -> Result<Workflow, ApiError> {
    match workflow {
        Value::String(text) => Workflow::from_yaml(&text).map_err(ApiError::from),
        Value::Object(_) => serde_json::from_value(workflow).map_err(|e| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_WORKFLOW",
                format!("failed to parse workflow: {}", e),
            )
        }),
        _ => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_WORKFLOW",
            "workflow must be YAML text or an object",
        )),
    }
}

async fn execute(
    state: &AppState,
    request: RunRequest,
    dry_run: bool,
    background: bool,
) -> Result<RunResponse, ApiError> {
    let validation = validate(&request.workflow);
    if dry_run {
        debug!(workflow_id = %validation.workflow_id, valid = validation.valid, "pipeline dry run");
        return Ok(RunResponse {
            validation,
            run: None,
        });
    }

    let request = RunRequest {
        cancel: Some(state.shutdown.clone()),
        ..request
    };
    let run = if background {
        state.pipelines.start(request)?
    } else {
        state.pipelines.run(request).await?
    };
    Ok(RunResponse {
        validation,
        run: Some(run),
    })
}

/// POST /pipelines/run - run a workflow file
pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RunPipelineBody>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let workflow = state.pipelines.load_workflow(&body.workflow_file)?;
    let request = RunRequest {
        workflow,
        workflow_file: Some(body.workflow_file),
        session: body.session,
        variables: body.variables,
        cancel: None,
    };
    execute(&state, request, body.dry_run, body.background)
        .await
        .map(Json)
}

/// POST /pipelines/exec - run an inline workflow (not resumable)
pub async fn exec_pipeline(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ExecPipelineBody>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let request = RunRequest {
        workflow: parse_inline(body.workflow)?,
        workflow_file: None,
        session: body.session,
        variables: body.variables,
        cancel: None,
    };
    execute(&state, request, body.dry_run, body.background)
        .await
        .map(Json)
}

/// POST /pipelines/validate - pure validation, never runs anything
pub async fn validate_pipeline(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Json<ValidationReport>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let workflow = match (body.workflow, body.workflow_file) {
        (Some(inline), _) => parse_inline(inline)?,
        (None, Some(file)) => state.pipelines.load_workflow(&file)?,
        (None, None) => return Err(ApiError::bad_request("workflow or workflow_file is required")),
    };
    Ok(Json(validate(&workflow)))
}

/// GET /pipelines - run states, newest first
pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.pipelines.list()?;
    let total = runs.len();
    Ok(Json(ApiResponse::with_total(runs, state.current_seq(), total)))
}

/// GET /pipelines/:id
pub async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StateResponse>, ApiError> {
    let run = state.pipelines.status(&id)?;
    Ok(Json(StateResponse { run }))
}

/// POST /pipelines/:id/cancel
pub async fn cancel_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StateResponse>, ApiError> {
    let run = state.pipelines.cancel(&id).await?;
    Ok(Json(StateResponse { run }))
}

/// POST /pipelines/:id/resume - continue from the interrupted step
pub async fn resume_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<StateResponse>, ApiError> {
    let body: ResumeBody = if body.iter().all(u8::is_ascii_whitespace) {
        ResumeBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };

    let started = state.pipelines.resume(
        &id,
        ResumeRequest {
            session: body.session,
            variables: body.variables,
            cancel: Some(state.shutdown.clone()),
        },
    )?;
    let run = if body.background {
        started
    } else {
        state.pipelines.wait(&started.run_id).await?
    };
    Ok(Json(StateResponse { run }))
}
