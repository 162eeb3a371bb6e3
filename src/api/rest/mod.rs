//! REST API module for HTTP endpoints
//!
//! - `GET /events/stats`, `GET /events/dropped` - store and hub introspection
//! - `POST /jobs`, `GET /jobs`, `GET /jobs/:id`, `DELETE /jobs/:id`
//! - `POST /pipelines/run`, `POST /pipelines/exec`, `POST /pipelines/validate`
//! - `GET /pipelines`, `GET /pipelines/:id`
//! - `POST /pipelines/:id/cancel`, `POST /pipelines/:id/resume`

pub mod events;
pub mod jobs;
pub mod pipelines;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{HubError, JobError, PipelineError, StoreError};

/// Standard API response wrapper for listings
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Response data
    pub data: T,
    /// Newest assigned seq when the response was built
    pub sequence_id: i64,
    /// Total count (for listings)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T, sequence_id: i64) -> Self {
        Self {
            data,
            sequence_id,
            total: None,
        }
    }

    pub fn with_total(data: T, sequence_id: i64, total: usize) -> Self {
        Self {
            data,
            sequence_id,
            total: Some(total),
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.to_string(),
            status,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn dependency_missing(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "DEPENDENCY_MISSING", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = %self.code, error = %self.error, "request failed");
        }
        (self.status, Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LogUnavailable => Self::dependency_missing(e.to_string()),
            StoreError::EmptyTopic | StoreError::Serialization(_) => Self::bad_request(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::InvalidPattern { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_PATTERN", e.to_string())
            }
            HubError::UnknownClient(_) => Self::not_found(e.to_string()),
            HubError::Store(inner) => inner.into(),
            HubError::Closed => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", e.to_string())
            }
        }
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::InvalidJobType(_) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_JOB_TYPE", e.to_string())
            }
            JobError::NotFound(_) => Self::not_found(e.to_string()),
            JobError::InvalidTransition { .. } => Self::conflict("INVALID_TRANSITION", e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InvalidWorkflow { .. }
            | PipelineError::WorkflowParse(_)
            | PipelineError::WorkflowRead { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_WORKFLOW", e.to_string())
            }
            PipelineError::MissingSession => Self::bad_request(e.to_string()),
            PipelineError::NotFound(_) => Self::not_found(e.to_string()),
            PipelineError::NotCancellable { .. } => {
                Self::conflict("PIPELINE_NOT_CANCELLABLE", e.to_string())
            }
            PipelineError::NotResumable { .. } | PipelineError::NoResumableState(_) => {
                Self::conflict("PIPELINE_NOT_RESUMABLE", e.to_string())
            }
            PipelineError::AlreadyRunning(_) => Self::conflict("PIPELINE_RUNNING", e.to_string()),
            PipelineError::State(_) | PipelineError::CorruptState(_) | PipelineError::Io(_) => {
                Self::internal(e.to_string())
            }
        }
    }
}
