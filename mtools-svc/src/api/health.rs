//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;

use crate::models::{HealthResponse, MemoryBody};
use crate::AppState;

/// GET /health
///
/// Reports uptime, slot usage and a fresh memory sample. Status is
/// "degraded" while the process is above its memory warning level.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let governor = state.gate.governor();
    let snapshot = governor.snapshot();
    let under_pressure = governor.is_under_pressure();

    Json(HealthResponse {
        status: (if under_pressure { "degraded" } else { "ok" }).to_string(),
        service: "mtools-svc".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        active_operations: state.gate.active(),
        max_concurrent_operations: state.gate.capacity(),
        memory: MemoryBody::new(&snapshot, under_pressure),
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
