//! Event store and hub introspection endpoints

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResponse};
use crate::api::websocket::state::AppState;
use crate::event_store::StoreStats;
use crate::hub::HubStats;
use crate::types::DroppedEventRecord;

/// Query parameters for `GET /events/dropped`
#[derive(Debug, Deserialize)]
pub struct DroppedParams {
    pub client_id: Option<String>,
    /// 0 means the store's default page
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct EventStatsResponse {
    pub store: StoreStats,
    pub hub: HubStats,
    /// Ring occupancy, 0.0..=1.0
    pub buffer_fill: f64,
    pub persistent: bool,
}

/// GET /events/stats - ring occupancy, log size, hub counters
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EventStatsResponse>, ApiError> {
    let store = state.store().stats().await?;
    let hub = state.hub.stats().await?;
    Ok(Json(EventStatsResponse {
        buffer_fill: store.buffer.fill_ratio(),
        persistent: store.persistent(),
        store,
        hub,
    }))
}

/// GET /events/dropped - persisted drop records, newest first
pub async fn list_dropped(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DroppedParams>,
) -> Result<Json<ApiResponse<Vec<DroppedEventRecord>>>, ApiError> {
    if !state.store().has_log() {
        return Err(ApiError::dependency_missing(
            "drop records need the event log; server is running memory-only",
        ));
    }
    let records = state
        .store()
        .dropped_events(params.client_id.as_deref(), params.limit)
        .await?;
    let total = records.len();
    Ok(Json(ApiResponse::with_total(records, state.current_seq(), total)))
}
