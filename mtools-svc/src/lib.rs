//! mtools-svc library interface
//!
//! The resource-governance core lives in [`services`]; [`api`] is a thin HTTP
//! surface over it. Exposed as a library for integration testing.

pub mod api;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult, GuardError, GuardResult};

use axum::{middleware, Router};
use chrono::{DateTime, Utc};
use mtools_common::TomlConfig;
use services::{
    AdmissionGate, AudioExtractor, ExitCleanupRegistry, ExtractSettings, MemoryGovernor,
    PathGuard, ProcessSupervisor, RetentionManager, StemJobSettings, StemSeparator,
    UploadStreamer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Multipart framing and form fields on top of the file bytes
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Application state shared across handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<TomlConfig>,
    /// Canonical upload staging directory
    pub upload_dir: PathBuf,
    /// Guard over the job output tree
    pub output_guard: PathGuard,
    pub streamer: UploadStreamer,
    pub gate: AdmissionGate,
    pub retention: RetentionManager,
    pub separator: StemSeparator,
    pub extractor: AudioExtractor,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the governance services from configuration
    ///
    /// Creates the storage directories if needed. The configuration should
    /// already have passed `validate()`.
    pub fn new(
        config: TomlConfig,
        governor: MemoryGovernor,
        registry: Arc<ExitCleanupRegistry>,
    ) -> GuardResult<Self> {
        for (_, dir) in config.storage.directories() {
            std::fs::create_dir_all(dir)?;
        }

        let storage = &config.storage;
        let upload_guard = PathGuard::new([&storage.upload_dir])?;
        let output_guard = PathGuard::new([&storage.output_dir])?;
        // Scratch space first: relative job paths resolve under temp
        let scratch_guard = PathGuard::new([&storage.temp_dir, &storage.upload_dir])?;
        let upload_dir = upload_guard.roots()[0].clone();

        let policy = config.retention.policy();
        let temp_policy = config.retention.temp_policy();
        let retention = storage.directories().into_iter().fold(
            RetentionManager::new(Arc::clone(&registry)),
            |manager, (label, dir)| {
                let max_age = if label == "temp" {
                    temp_policy.max_age
                } else {
                    policy.max_age
                };
                manager.with_directory(label, dir, max_age)
            },
        );

        let gate = AdmissionGate::new(config.limits.max_concurrent_operations, governor.clone());
        let supervisor = ProcessSupervisor::new(
            governor,
            Duration::from_millis(config.memory.check_interval_ms),
            config.tools.max_captured_output_bytes,
        );
        let streamer = UploadStreamer::new(
            config.limits.max_upload_bytes(),
            config.limits.chunk_size_bytes,
            Some(registry),
        );
        let separator = StemSeparator::new(
            scratch_guard.clone(),
            output_guard.clone(),
            gate.clone(),
            supervisor.clone(),
            retention.clone(),
            StemJobSettings::from_config(&config),
        );
        let extractor = AudioExtractor::new(
            scratch_guard,
            output_guard.clone(),
            gate.clone(),
            supervisor,
            retention.clone(),
            ExtractSettings::from_config(&config),
        );

        Ok(Self {
            config: Arc::new(config),
            upload_dir,
            output_guard,
            streamer,
            gate,
            retention,
            separator,
            extractor,
            startup_time: Utc::now(),
        })
    }
}

/// Build application router
///
/// `/health` is public; everything under `/api/v1` passes the API-key check.
pub fn build_router(state: AppState) -> Router {
    let upload_body_limit = state
        .config
        .limits
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let upload_body_limit = usize::try_from(upload_body_limit).unwrap_or(usize::MAX);

    let v1 = Router::new()
        .merge(api::storage_routes())
        .merge(api::download_routes())
        .merge(api::youtube_routes())
        .merge(api::stem_routes(upload_body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::auth_middleware,
        ));

    Router::new()
        .merge(api::health_routes())
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
