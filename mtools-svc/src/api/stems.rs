//! Stem separation upload

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::convert::Infallible;
use tokio_util::io::StreamReader;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use super::{encode_path_segment, rejected};
use crate::error::{ApiError, ApiResult};
use crate::models::responses::OptionInfo;
use crate::models::{FormatsResponse, ModelsResponse, StemForm, StemSeparationResponse};
use crate::services::tool_commands::{SeparationModel, StemFormat};
use crate::services::upload_policy::check_declared_upload;
use crate::services::upload_streamer::UploadSession;
use crate::AppState;

/// POST /api/v1/separate-stems
///
/// Multipart fields: `file` (required), `model`, `output_format`, `stems`
/// (comma-separated; blank means all). The file part is streamed to disk as
/// it arrives.
pub async fn separate_stems(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<StemSeparationResponse>> {
    let mut form = StemForm::default();
    let mut upload: Option<UploadSession> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name != "file" {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("Unreadable field '{}': {}", name, e)))?;
            form.set(&name, value).map_err(rejected("separate_stems"))?;
            continue;
        }

        if upload.is_some() {
            return Err(ApiError::BadRequest("Only one file may be uploaded".to_string()));
        }

        let declared_filename = field.file_name().unwrap_or_default().to_string();
        let declared = check_declared_upload(field.file_name(), field.content_type())
            .map_err(rejected("separate_stems"))?;

        let reader = StreamReader::new(field.map_err(std::io::Error::other));
        tokio::pin!(reader);
        let session = state
            .streamer
            .stream(reader, &state.upload_dir, declared, &declared_filename)
            .await?;
        upload = Some(session);
    }

    let upload = upload.ok_or_else(|| ApiError::BadRequest("No file provided".to_string()))?;
    let request = form.into_request().map_err(rejected("separate_stems"))?;

    info!(
        bytes = upload.bytes_received(),
        format = %upload.sniff().detected_format,
        "Accepted stem separation upload"
    );

    let output = state
        .separator
        .run(&upload, &request)
        .await
        .map_err(rejected("separate_stems"))?;

    let stems: BTreeMap<_, _> = output
        .stem_files
        .iter()
        .map(|(stem, file)| {
            (
                *stem,
                format!("/api/v1/download/{}/{}", output.job_id, encode_path_segment(file)),
            )
        })
        .collect();

    Ok(Json(StemSeparationResponse {
        success: true,
        message: "Stems separated successfully".to_string(),
        job_id: output.job_id,
        stems,
        processing_time_seconds: (output.processing_time.as_secs_f64() * 100.0).round() / 100.0,
    }))
}

/// GET /api/v1/models
pub async fn list_models() -> Json<ModelsResponse> {
    let models = SeparationModel::ALL
        .iter()
        .map(|model| OptionInfo {
            name: model.as_str(),
            description: match model {
                SeparationModel::Htdemucs => "Hybrid Transformer Demucs - Best overall quality",
                SeparationModel::HtdemucsFt => {
                    "Fine-tuned Hybrid Transformer Demucs - Improved vocals"
                }
                SeparationModel::MdxExtra => "MDX Extra - Good for electronic music",
                SeparationModel::MdxExtraQ => "MDX Extra Quantized - Faster processing",
            },
            recommended: *model == SeparationModel::default(),
        })
        .collect();

    Json(ModelsResponse {
        models,
        default_model: SeparationModel::default().as_str(),
    })
}

/// GET /api/v1/formats
pub async fn list_formats() -> Json<FormatsResponse> {
    let formats = StemFormat::ALL
        .iter()
        .map(|format| OptionInfo {
            name: format.as_str(),
            description: match format {
                StemFormat::Wav => "WAV - Uncompressed, highest quality",
                StemFormat::Mp3 => "MP3 - Compressed, good quality, smaller files",
                StemFormat::Flac => "FLAC - Lossless compression",
            },
            recommended: *format == StemFormat::Wav,
        })
        .collect();

    Json(FormatsResponse {
        formats,
        default_format: StemFormat::default().as_str(),
    })
}

/// Build stem separation routes
///
/// The upload route swaps axum's default body cap for one sized to the
/// upload ceiling; the streamer still enforces the exact file limit.
pub fn stem_routes(body_limit: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/separate-stems",
            post(separate_stems)
                .layer::<_, Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
        .route("/models", get(list_models))
        .route("/formats", get(list_formats))
}
