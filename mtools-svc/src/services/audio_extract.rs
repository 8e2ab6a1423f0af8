//! Audio extraction from video links
//!
//! Runs the downloader for one whitelisted video inside an admission slot.
//! The tool writes into a private scratch directory; the finished file is
//! moved to `output_dir/<file_id>/`.

use crate::error::{GuardError, GuardResult};
use crate::services::admission_gate::AdmissionGate;
use crate::services::memory_governor::OperationClass;
use crate::services::path_guard::{validate_filename, PathGuard, ValidatedPath};
use crate::services::process_supervisor::ProcessSupervisor;
use crate::services::retention_manager::RetentionManager;
use crate::services::tool_commands::{download_command, AudioQuality, DownloadFormat, VideoSource};
use mtools_common::TomlConfig;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// One extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub source: VideoSource,
    pub format: DownloadFormat,
    pub quality: AudioQuality,
}

/// A finished extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOutput {
    pub file_id: String,
    /// File name inside `output_dir/<file_id>/`
    pub filename: String,
    pub size_bytes: u64,
    pub processing_time: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub downloader_program: String,
    pub download_timeout: Duration,
    pub memory_ceiling_mb: u64,
    pub admission_wait: Duration,
}

impl ExtractSettings {
    pub fn from_config(config: &TomlConfig) -> Self {
        Self {
            downloader_program: config.tools.downloader_program.clone(),
            download_timeout: Duration::from_secs(config.tools.download_timeout_secs),
            memory_ceiling_mb: config.memory.subprocess_limit_mb,
            admission_wait: Duration::from_secs(config.limits.admission_wait_secs),
        }
    }
}

/// Runs extraction jobs
#[derive(Debug, Clone)]
pub struct AudioExtractor {
    temp_guard: PathGuard,
    output_guard: PathGuard,
    gate: AdmissionGate,
    supervisor: ProcessSupervisor,
    retention: RetentionManager,
    settings: ExtractSettings,
}

impl AudioExtractor {
    pub fn new(
        temp_guard: PathGuard,
        output_guard: PathGuard,
        gate: AdmissionGate,
        supervisor: ProcessSupervisor,
        retention: RetentionManager,
        settings: ExtractSettings,
    ) -> Self {
        Self {
            temp_guard,
            output_guard,
            gate,
            supervisor,
            retention,
            settings,
        }
    }

    pub async fn run(&self, request: &ExtractRequest) -> GuardResult<ExtractOutput> {
        let started = Instant::now();

        // Size is unknown up front, so the estimate is the configured floor
        let estimated_mb = self.gate.governor().estimate(0, OperationClass::Download);
        let _slot = self
            .gate
            .acquire_wait(
                OperationClass::Download.as_str(),
                estimated_mb,
                self.settings.admission_wait,
            )
            .await?;

        let file_id = Uuid::new_v4().to_string();
        info!(
            file_id = %file_id,
            video_id = request.source.video_id(),
            format = %request.format,
            quality = request.quality.value(),
            "Starting audio extraction"
        );

        let work_dir = self.temp_guard.validate(format!("download-{}", file_id), false)?;
        tokio::fs::create_dir(work_dir.as_path()).await?;
        let _work_scope = self.retention.scoped(work_dir.as_path());

        let output_stem = self
            .temp_guard
            .validate(work_dir.as_path().join(&file_id), false)?;
        let command = download_command(
            &self.settings.downloader_program,
            &request.source,
            request.format,
            request.quality,
            output_stem,
        );
        self.supervisor
            .run_checked(&command, self.settings.download_timeout, self.settings.memory_ceiling_mb)
            .await?;

        let downloaded = find_downloaded_file(work_dir.as_path(), &file_id, request.format)
            .await?
            .ok_or_else(|| GuardError::ToolFailure {
                code: Some(0),
                detail: "Downloaded file not found".to_string(),
            })?;
        let downloaded = self.temp_guard.validate(&downloaded, true)?;

        let job_dir = self.output_guard.validate(&file_id, false)?;
        tokio::fs::create_dir(job_dir.as_path()).await?;
        let job_scope = self.retention.scoped(job_dir.as_path());

        let filename = validate_filename(&format!("audio_{}.{}", file_id, request.format))?;
        let target = self
            .output_guard
            .validate(job_dir.as_path().join(&filename), false)?;
        move_file(&downloaded, &target).await?;
        let size_bytes = tokio::fs::metadata(target.as_path()).await?.len();

        job_scope.disarm();
        let processing_time = started.elapsed();
        info!(
            file_id = %file_id,
            bytes = size_bytes,
            seconds = processing_time.as_secs_f64(),
            "Audio extraction complete"
        );

        Ok(ExtractOutput {
            file_id,
            filename,
            size_bytes,
            processing_time,
        })
    }
}

/// The file the downloader produced for `file_id` in the requested format
async fn find_downloaded_file(
    work_dir: &Path,
    file_id: &str,
    format: DownloadFormat,
) -> GuardResult<Option<std::path::PathBuf>> {
    let mut entries = tokio::fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name_matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem == file_id);
        let ext_matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(format.as_str()));
        if name_matches && ext_matches && entry.file_type().await?.is_file() {
            return Ok(Some(path));
        }
        debug!(path = %path.display(), "Ignoring downloader side file");
    }
    Ok(None)
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(from: &ValidatedPath, to: &ValidatedPath) -> GuardResult<()> {
    if tokio::fs::rename(from.as_path(), to.as_path()).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from.as_path(), to.as_path()).await?;
    tokio::fs::remove_file(from.as_path()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_find_downloaded_file_ignores_side_files() {
        let dir = TempDir::new().unwrap();
        let id = "0b6f3b1e-52f1-4b8e-9c55-0d6b1f3f1a2b";
        std::fs::write(dir.path().join(format!("{}.webm", id)), b"x").unwrap();
        std::fs::write(dir.path().join(format!("{}.mp3.part", id)), b"x").unwrap();
        std::fs::write(dir.path().join("other.mp3"), b"x").unwrap();
        assert!(find_downloaded_file(dir.path(), id, DownloadFormat::Mp3)
            .await
            .unwrap()
            .is_none());

        std::fs::write(dir.path().join(format!("{}.mp3", id)), b"ID3").unwrap();
        let found = find_downloaded_file(dir.path(), id, DownloadFormat::Mp3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, dir.path().join(format!("{}.mp3", id)));
    }
}
