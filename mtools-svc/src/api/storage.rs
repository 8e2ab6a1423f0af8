//! Storage statistics and manual cleanup

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::error::{ApiResult, GuardError};
use crate::models::responses::CleanupInfo;
use crate::models::{CleanupResponse, DirectoryStatsBody, StatsResponse};
use crate::services::cleanup_scheduler::sweep_now;
use crate::services::retention_manager::SweepStatus;
use crate::AppState;

/// GET /api/v1/stats
pub async fn storage_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let retention = state.retention.clone();
    let all = tokio::task::spawn_blocking(move || retention.stats_all())
        .await
        .map_err(|e| {
            error!("Stats task failed: {}", e);
            GuardError::Internal("stats task failed".to_string())
        })?;

    let total_files = all.iter().map(|(_, s)| s.file_count).sum();
    let total_bytes: u64 = all.iter().map(|(_, s)| s.total_size_bytes).sum();
    let directories: BTreeMap<String, DirectoryStatsBody> = all
        .into_iter()
        .map(|(label, stats)| (label, stats.into()))
        .collect();

    Ok(Json(StatsResponse {
        directories,
        total_files,
        total_size_mb: (total_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
        cleanup_info: CleanupInfo {
            retention_hours: state.config.retention.file_retention_hours,
            cleanup_interval_hours: state.config.retention.cleanup_interval_hours,
        },
    }))
}

/// POST /api/v1/cleanup
///
/// Runs one sweep immediately, with the same age limits as the scheduler.
pub async fn manual_cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
    let reports = sweep_now(&state.retention).await;
    let total_removed = reports.iter().map(|r| r.removed_files).sum();
    let success = reports.iter().all(|r| r.status == SweepStatus::Success);
    info!(total_removed, "Manual cleanup completed");

    Json(CleanupResponse {
        success,
        total_removed,
        results: reports.into_iter().map(|r| (r.label.clone(), r)).collect(),
    })
}

/// Build storage routes
pub fn storage_routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(storage_stats))
        .route("/cleanup", post(manual_cleanup))
}
