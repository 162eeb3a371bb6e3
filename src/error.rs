//! Error types
//!
//! Each subsystem has its own error enum; the HTTP layer maps them onto
//! stable error codes in `api::rest`.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::JobStatus;
use crate::utils::AtomicError;

/// Event store and durable log errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event log error: {0}")]
    Log(#[from] rusqlite::Error),

    #[error("event log unavailable")]
    LogUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Fan-out hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is shut down")]
    Closed,

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Job store errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job type: {0}")]
    InvalidJobType(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Failure reported by a job handler
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        Self(e.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Failure of a single pipeline step
#[derive(Debug, Error)]
pub enum StepError {
    #[error("unsupported step: {0}")]
    Unsupported(String),

    #[error("step timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("command exited with status {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Pipeline executor and workflow errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid workflow: {}", .errors.join("; "))]
    InvalidWorkflow { errors: Vec<String> },

    #[error("failed to read workflow {path}: {source}")]
    WorkflowRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow: {0}")]
    WorkflowParse(#[from] serde_yaml::Error),

    #[error("pipeline run not found: {0}")]
    NotFound(String),

    #[error("pipeline run {run_id} is {status} and cannot be cancelled")]
    NotCancellable { run_id: String, status: String },

    #[error("pipeline run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: String, status: String },

    #[error("pipeline run {0} is already active")]
    AlreadyRunning(String),

    #[error("no resumable state for run {0}")]
    NoResumableState(String),

    #[error("session is required")]
    MissingSession,

    #[error("state persistence failed: {0}")]
    State(#[from] AtomicError),

    #[error("state file is corrupt: {0}")]
    CorruptState(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    Env { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal errors from the server binary
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event log required but unavailable: {0}")]
    LogRequired(StoreError),

    #[error("failed to prepare pipeline state: {0}")]
    PipelineState(#[from] PipelineError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServeError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            ServeError::Config(_) => 2,
            ServeError::LogRequired(_) => 3,
            ServeError::PipelineState(_)
            | ServeError::Signal(_)
            | ServeError::Bind { .. }
            | ServeError::Io(_) => 1,
        }
    }
}
