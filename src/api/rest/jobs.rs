//! Job endpoints

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};

use super::{ApiError, ApiResponse};
use crate::api::websocket::state::AppState;
use crate::types::Job;

/// Single-job response body
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: Job,
}

/// POST /jobs - body `{ type, ...opts }`
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(mut opts) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let job_type = match opts.remove("type") {
        Some(Value::String(t)) => t,
        _ => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_JOB_TYPE",
                "job type is required",
            ))
        }
    };

    let job = state.jobs.create(&job_type, opts)?;
    Ok((StatusCode::ACCEPTED, Json(JobResponse { job })))
}

/// GET /jobs - all jobs, oldest first
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let jobs = state.jobs.list();
    let total = jobs.len();
    Json(ApiResponse::with_total(jobs, state.current_seq(), total))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.jobs.get(&id)?;
    Ok(Json(JobResponse { job }))
}

/// DELETE /jobs/:id - cancel; repeated calls return the terminal job
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.jobs.cancel(&id)?;
    Ok(Json(JobResponse { job }))
}
