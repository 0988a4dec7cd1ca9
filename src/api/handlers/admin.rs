use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::JSend;
use crate::stats::GlobalStats;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Per-shard row counts, bytes and latest upload. Degraded shards are
/// reported in place rather than failing the request.
pub async fn global_stats(State(state): State<Arc<AppState>>) -> Json<JSend<GlobalStats>> {
    JSend::success(state.stats.global_stats().await)
}
