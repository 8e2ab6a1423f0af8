//! Stem file downloads

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::io::ReaderStream;
use tracing::info;

use super::rejected;
use crate::error::{ApiError, ApiResult};
use crate::services::path_guard::{validate_filename, validate_identifier};
use crate::services::upload_policy::content_type_for;
use crate::AppState;

/// GET /api/v1/download/:job_id/:filename
///
/// Both segments are validated on their own before the joined path goes
/// through the output guard.
pub async fn download_stem(
    State(state): State<AppState>,
    Path((job_id, filename)): Path<(String, String)>,
) -> ApiResult<Response> {
    let job_id = validate_identifier(&job_id, "job").map_err(rejected("download"))?;
    let filename = validate_filename(&filename).map_err(rejected("download"))?;

    let path = state
        .output_guard
        .validate(std::path::Path::new(&job_id).join(&filename), false)
        .map_err(rejected("download"))?;

    if !path.as_path().is_file() {
        return Err(ApiError::NotFound("File not found".to_string()));
    }

    let file = tokio::fs::File::open(path.as_path()).await?;
    let size = file.metadata().await?.len();
    info!(job_id = %job_id, file = %filename, bytes = size, "Serving stem download");

    let content_type = content_type_for(path.as_path());
    let disposition = if filename.contains('"') {
        "attachment".to_string()
    } else {
        format!("attachment; filename=\"{}\"", filename)
    };

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// Build download routes
pub fn download_routes() -> Router<AppState> {
    Router::new().route("/download/:job_id/:filename", get(download_stem))
}
