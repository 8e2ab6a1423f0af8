//! Response bodies

use crate::services::memory_governor::MemorySnapshot;
use crate::services::retention_manager::{DirectoryStats, SweepReport};
use crate::services::tool_commands::StemName;
use serde::Serialize;
use std::collections::BTreeMap;

/// GET /health
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while the process is above its memory warning level
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_operations: usize,
    pub max_concurrent_operations: usize,
    pub memory: MemoryBody,
}

/// Memory figures reported by health
#[derive(Debug, Serialize)]
pub struct MemoryBody {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_percent: f64,
    pub process_mb: u64,
    pub under_pressure: bool,
}

impl MemoryBody {
    pub fn new(snapshot: &MemorySnapshot, under_pressure: bool) -> Self {
        Self {
            total_mb: snapshot.total_mb,
            available_mb: snapshot.available_mb,
            used_percent: snapshot.used_percent,
            process_mb: snapshot.process_rss_mb,
            under_pressure,
        }
    }
}

/// Per-directory entry of GET /stats
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryStatsBody {
    pub exists: bool,
    pub file_count: u64,
    pub total_size_mb: f64,
    pub oldest_file_age_hours: f64,
}

impl From<DirectoryStats> for DirectoryStatsBody {
    fn from(stats: DirectoryStats) -> Self {
        Self {
            exists: stats.exists,
            file_count: stats.file_count,
            total_size_mb: stats.total_size_mb(),
            oldest_file_age_hours: stats.oldest_age_hours(),
        }
    }
}

/// Retention settings echoed by GET /stats
#[derive(Debug, Serialize)]
pub struct CleanupInfo {
    pub retention_hours: u64,
    pub cleanup_interval_hours: u64,
}

/// GET /stats
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub directories: BTreeMap<String, DirectoryStatsBody>,
    pub total_files: u64,
    pub total_size_mb: f64,
    pub cleanup_info: CleanupInfo,
}

/// POST /cleanup
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub total_removed: usize,
    pub results: BTreeMap<String, SweepReport>,
}

/// POST /separate-stems
#[derive(Debug, Serialize)]
pub struct StemSeparationResponse {
    pub success: bool,
    pub message: String,
    pub job_id: String,
    /// Stem -> download URL
    pub stems: BTreeMap<StemName, String>,
    pub processing_time_seconds: f64,
}

/// POST /youtube-to-mp3
#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub success: bool,
    pub message: String,
    pub file_id: String,
    pub filename: String,
    pub file_size_mb: f64,
    pub download_url: String,
}

/// One selectable option with a description
#[derive(Debug, Serialize)]
pub struct OptionInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub recommended: bool,
}

/// GET /models
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<OptionInfo>,
    pub default_model: &'static str,
}

/// GET /formats
#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    pub formats: Vec<OptionInfo>,
    pub default_format: &'static str,
}
