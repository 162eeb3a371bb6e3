//! HTTP server setup with Axum

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use super::rest::{events, jobs, pipelines};
use super::sse::events_handler;
use super::websocket::{handler::ws_handler, state::AppState};

/// Create the Axum router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Streaming transports
        .route("/ws", get(ws_handler))
        .route("/events", get(events_handler))
        // Health check
        .route("/health", get(health_check))
        // Event introspection
        .route("/events/stats", get(events::get_stats))
        .route("/events/dropped", get(events::list_dropped))
        // Jobs
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        // Pipelines
        .route("/pipelines", get(pipelines::list_pipelines))
        .route("/pipelines/run", post(pipelines::run_pipeline))
        .route("/pipelines/exec", post(pipelines::exec_pipeline))
        .route("/pipelines/validate", post(pipelines::validate_pipeline))
        .route("/pipelines/:id", get(pipelines::get_pipeline))
        .route("/pipelines/:id/cancel", post(pipelines::cancel_pipeline))
        .route("/pipelines/:id/resume", post(pipelines::resume_pipeline))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "current_seq": state.current_seq(),
        "persistent": state.store().has_log(),
    }))
}
