//! Stem separation jobs
//!
//! Runs one separation from a staged upload to stem files under
//! `output_dir/<job_id>/`. Every path handed to a tool goes through the path
//! guards, the tool runs inside an admission slot, and the job's scratch
//! space is removed whatever the outcome. The job output directory is kept
//! only when at least one stem was produced; after that it belongs to the
//! retention sweep.

use crate::error::{GuardError, GuardResult};
use crate::services::admission_gate::AdmissionGate;
use crate::services::memory_governor::OperationClass;
use crate::services::path_guard::{validate_filename, PathGuard, ValidatedPath};
use crate::services::process_supervisor::ProcessSupervisor;
use crate::services::retention_manager::RetentionManager;
use crate::services::tool_commands::{
    separation_command, transcode_command, SeparationModel, StemFormat, StemName,
};
use crate::services::upload_streamer::UploadSession;
use mtools_common::TomlConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// What to produce from one upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StemRequest {
    pub model: SeparationModel,
    pub format: StemFormat,
    /// Empty means every stem the model produced
    pub stems: Vec<StemName>,
}

/// A finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemJobOutput {
    pub job_id: String,
    /// Stem -> file name inside the job directory
    pub stem_files: BTreeMap<StemName, String>,
    pub processing_time: Duration,
}

/// Tool settings for separation jobs
#[derive(Debug, Clone)]
pub struct StemJobSettings {
    pub python_program: String,
    pub transcoder_program: String,
    pub separation_timeout: Duration,
    pub transcode_timeout: Duration,
    pub memory_ceiling_mb: u64,
    pub admission_wait: Duration,
}

impl StemJobSettings {
    pub fn from_config(config: &TomlConfig) -> Self {
        Self {
            python_program: config.tools.python_program.clone(),
            transcoder_program: config.tools.transcoder_program.clone(),
            separation_timeout: Duration::from_secs(config.tools.separation_timeout_secs),
            transcode_timeout: Duration::from_secs(config.tools.transcode_timeout_secs),
            memory_ceiling_mb: config.memory.subprocess_limit_mb,
            admission_wait: Duration::from_secs(config.limits.admission_wait_secs),
        }
    }
}

/// Runs separation jobs
#[derive(Debug, Clone)]
pub struct StemSeparator {
    temp_guard: PathGuard,
    output_guard: PathGuard,
    gate: AdmissionGate,
    supervisor: ProcessSupervisor,
    retention: RetentionManager,
    settings: StemJobSettings,
}

impl StemSeparator {
    pub fn new(
        temp_guard: PathGuard,
        output_guard: PathGuard,
        gate: AdmissionGate,
        supervisor: ProcessSupervisor,
        retention: RetentionManager,
        settings: StemJobSettings,
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

    /// Separate `upload` into stems
    pub async fn run(&self, upload: &UploadSession, request: &StemRequest) -> GuardResult<StemJobOutput> {
        let started = Instant::now();

        upload.check_content()?;
        let input = self.temp_guard.validate(upload.path(), true)?;

        let estimated_mb = self
            .gate
            .governor()
            .estimate(upload.bytes_received(), OperationClass::Separation);
        let _slot = self
            .gate
            .acquire_wait(
                OperationClass::Separation.as_str(),
                estimated_mb,
                self.settings.admission_wait,
            )
            .await?;

        let job_id = Uuid::new_v4().to_string();
        info!(job_id = %job_id, model = %request.model, format = %request.format, "Starting stem separation");

        // Scratch space for the separation tool, removed on every exit path
        let work_dir = self.temp_guard.validate(format!("stems-{}", job_id), false)?;
        tokio::fs::create_dir(work_dir.as_path()).await?;
        let _work_scope = self.retention.scoped(work_dir.as_path());

        let separated = work_dir.as_path().join("separated");
        tokio::fs::create_dir(&separated).await?;
        let separated = self.temp_guard.validate_dir(&separated)?;

        let command = separation_command(
            &self.settings.python_program,
            request.model,
            separated.clone(),
            input,
        );
        self.supervisor
            .run_checked(&command, self.settings.separation_timeout, self.settings.memory_ceiling_mb)
            .await?;

        let stems_dir = find_stems_directory(separated.as_path()).ok_or_else(|| GuardError::ToolFailure {
            code: Some(0),
            detail: "Could not find separated stems in output".to_string(),
        })?;

        // Partial outputs are removed unless the job completes
        let job_dir = self.output_guard.validate(&job_id, false)?;
        tokio::fs::create_dir(job_dir.as_path()).await?;
        let job_scope = self.retention.scoped(job_dir.as_path());
        let job_dir = self.output_guard.validate_dir(job_dir.as_path())?;

        let base_name = upload.declared().map(|d| d.base_name.as_str());
        let stem_files = self
            .process_stems(&stems_dir, &job_dir, base_name, request)
            .await?;

        if stem_files.is_empty() {
            return Err(GuardError::ToolFailure {
                code: Some(0),
                detail: "No stem files were created".to_string(),
            });
        }

        job_scope.disarm();
        let processing_time = started.elapsed();
        info!(
            job_id = %job_id,
            stems = stem_files.len(),
            seconds = processing_time.as_secs_f64(),
            "Stem separation complete"
        );

        Ok(StemJobOutput {
            job_id,
            stem_files,
            processing_time,
        })
    }

    async fn process_stems(
        &self,
        stems_dir: &Path,
        job_dir: &ValidatedPath,
        base_name: Option<&str>,
        request: &StemRequest,
    ) -> GuardResult<BTreeMap<StemName, String>> {
        let wanted: &[StemName] = if request.stems.is_empty() {
            StemName::ALL
        } else {
            &request.stems
        };

        let mut produced = BTreeMap::new();
        for stem in wanted {
            let source = stems_dir.join(format!("{}.wav", stem));
            if !source.is_file() {
                continue;
            }
            let source = self.temp_guard.validate(&source, true)?;

            let file_name = match base_name {
                Some(base) => format!("{} - {}.{}", base, stem, request.format),
                None => format!("{}.{}", stem, request.format),
            };
            let file_name = validate_filename(&file_name)?;
            let target = self
                .output_guard
                .validate(job_dir.as_path().join(&file_name), false)?;

            match transcode_command(
                &self.settings.transcoder_program,
                source.clone(),
                request.format,
                target.clone(),
            ) {
                None => {
                    tokio::fs::copy(source.as_path(), target.as_path()).await?;
                }
                Some(command) => {
                    match self
                        .supervisor
                        .run_checked(&command, self.settings.transcode_timeout, self.settings.memory_ceiling_mb)
                        .await
                    {
                        Ok(_) => {}
                        // One stem failing to convert does not sink the job
                        Err(GuardError::ToolFailure { code, .. }) => {
                            warn!(stem = %stem, exit_code = code, "Failed to convert stem, skipping");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            info!(stem = %stem, file = %file_name, "Processed stem");
            produced.insert(*stem, file_name);
        }

        Ok(produced)
    }
}

/// First directory under `root` holding at least two `.wav` files
fn find_stems_directory(root: &Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .find(|dir| {
            std::fs::read_dir(dir.path())
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter(|e| {
                            e.path().extension().is_some_and(|ext| ext == "wav")
                                && e.file_type().is_ok_and(|t| t.is_file())
                        })
                        .count()
                        >= 2
                })
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
}
