//! Audio extraction from video links

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use tracing::info;

use super::{encode_path_segment, rejected};
use crate::error::{ApiError, ApiResult};
use crate::models::{ExtractForm, ExtractResponse};
use crate::AppState;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// POST /api/v1/youtube-to-mp3
///
/// Body: `{"url": ..., "audio_quality": 0-10, "audio_format": ...}`. Only
/// the video id of the URL is kept; the downloader sees a rebuilt link.
pub async fn youtube_to_audio(
    State(state): State<AppState>,
    body: Result<Json<ExtractForm>, JsonRejection>,
) -> ApiResult<Json<ExtractResponse>> {
    let Json(form) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = form.into_request().map_err(rejected("youtube_to_audio"))?;

    let output = state
        .extractor
        .run(&request)
        .await
        .map_err(rejected("youtube_to_audio"))?;
    info!(file_id = %output.file_id, "Audio ready for download");

    let download_url = format!(
        "/api/v1/download/{}/{}",
        output.file_id,
        encode_path_segment(&output.filename)
    );
    Ok(Json(ExtractResponse {
        success: true,
        message: "Audio downloaded and converted successfully".to_string(),
        file_size_mb: (output.size_bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0,
        file_id: output.file_id,
        filename: output.filename,
        download_url,
    }))
}

/// Build audio extraction routes
pub fn youtube_routes() -> Router<AppState> {
    Router::new().route("/youtube-to-mp3", post(youtube_to_audio))
}
