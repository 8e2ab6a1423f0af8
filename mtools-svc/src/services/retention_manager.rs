//! Disk retention
//!
//! Age-based sweeps over the managed directories, per-directory stats, and
//! the entry points to exit-time and scoped cleanup. Sweeps keep no state:
//! every run rescans the filesystem.

use crate::error::{GuardError, GuardResult};
use crate::services::exit_cleanup::{ExitCleanupRegistry, ScopedPath};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A directory under retention, with its own age limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDirectory {
    pub label: String,
    pub path: PathBuf,
    pub max_age: Duration,
}

/// Outcome status of one directory sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepStatus {
    Success,
    Error,
}

/// Result of sweeping one managed directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub label: String,
    pub removed_files: usize,
    pub status: SweepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time contents of a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub exists: bool,
    pub file_count: u64,
    pub total_size_bytes: u64,
    /// Age of the oldest file; zero when there are none
    pub oldest_age: Duration,
}

impl DirectoryStats {
    pub fn total_size_mb(&self) -> f64 {
        (self.total_size_bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
    }

    pub fn oldest_age_hours(&self) -> f64 {
        (self.oldest_age.as_secs_f64() / 3600.0 * 10.0).round() / 10.0
    }
}

/// Owns the retention rules for the service's directories
#[derive(Debug, Clone)]
pub struct RetentionManager {
    directories: Vec<ManagedDirectory>,
    registry: Arc<ExitCleanupRegistry>,
}

impl RetentionManager {
    pub fn new(registry: Arc<ExitCleanupRegistry>) -> Self {
        Self {
            directories: Vec::new(),
            registry,
        }
    }

    /// Add a directory to sweep with its own age limit
    pub fn with_directory(
        mut self,
        label: impl Into<String>,
        path: impl Into<PathBuf>,
        max_age: Duration,
    ) -> Self {
        self.directories.push(ManagedDirectory {
            label: label.into(),
            path: path.into(),
            max_age,
        });
        self
    }

    pub fn directories(&self) -> &[ManagedDirectory] {
        &self.directories
    }

    pub fn registry(&self) -> &Arc<ExitCleanupRegistry> {
        &self.registry
    }

    /// Remove files older than `max_age` under `directory`, then the
    /// directories this pass left empty
    ///
    /// A directory is only pruned if a file beneath it was removed here, so
    /// fresh empty job directories survive. Symlinks are never followed. The
    /// root itself is kept. A missing root sweeps nothing.
    pub fn sweep(directory: &Path, max_age: Duration) -> GuardResult<usize> {
        if !directory.exists() {
            return Ok(0);
        }
        if !directory.is_dir() {
            return Err(GuardError::Validation(format!(
                "not a directory: {}",
                directory.display()
            )));
        }

        let now = SystemTime::now();
        let mut removed = 0usize;
        let mut emptied: BTreeSet<PathBuf> = BTreeSet::new();

        for entry in WalkDir::new(directory).follow_links(false).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error accessing entry during sweep: {}", e);
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }

            // Regular files and the links themselves (targets untouched)
            let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                debug!(path = %entry.path().display(), "Skipping entry without mtime");
                continue;
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %entry.path().display(), "Removed old file");
                    let mut parent = entry.path().parent();
                    while let Some(dir) = parent.filter(|d| *d != directory) {
                        if !emptied.insert(dir.to_path_buf()) {
                            break;
                        }
                        parent = dir.parent();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.path().display(), "Failed to remove file: {}", e),
            }
        }

        // Children sort after their parents, so reverse order is deepest
        // first. A failure means the directory still holds something.
        for dir in emptied.iter().rev() {
            if fs::remove_dir(dir).is_ok() {
                debug!(path = %dir.display(), "Removed empty directory");
            }
        }

        Ok(removed)
    }

    /// Sweep every managed directory with its own age limit
    pub fn sweep_all(&self) -> Vec<SweepReport> {
        let mut reports = Vec::with_capacity(self.directories.len());
        for dir in &self.directories {
            let report = match Self::sweep(&dir.path, dir.max_age) {
                Ok(removed) => {
                    if removed > 0 {
                        info!(directory = %dir.label, removed, "Cleaned up old files");
                    }
                    SweepReport {
                        label: dir.label.clone(),
                        removed_files: removed,
                        status: SweepStatus::Success,
                        error: None,
                    }
                }
                Err(e) => {
                    error!(directory = %dir.label, "Failed to clean directory: {}", e);
                    SweepReport {
                        label: dir.label.clone(),
                        removed_files: 0,
                        status: SweepStatus::Error,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    /// Make sure `path` does not outlive the process
    pub fn register_for_exit_cleanup(&self, path: impl Into<PathBuf>) {
        self.registry.register(path);
    }

    /// Remove `path` when the returned guard is dropped
    pub fn scoped(&self, path: impl Into<PathBuf>) -> ScopedPath {
        ScopedPath::new(path, Some(Arc::clone(&self.registry)))
    }

    /// Count, size and oldest age of files under `directory`
    pub fn stats(directory: &Path) -> DirectoryStats {
        if !directory.is_dir() {
            return DirectoryStats::default();
        }

        let now = SystemTime::now();
        let mut stats = DirectoryStats {
            exists: true,
            ..DirectoryStats::default()
        };

        for entry in WalkDir::new(directory)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            stats.file_count += 1;
            stats.total_size_bytes += meta.len();
            if let Ok(modified) = meta.modified() {
                let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                stats.oldest_age = stats.oldest_age.max(age);
            }
        }

        stats
    }

    /// Stats for every managed directory, by label
    pub fn stats_all(&self) -> Vec<(String, DirectoryStats)> {
        self.directories
            .iter()
            .map(|dir| (dir.label.clone(), Self::stats(&dir.path)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_aged(path: &Path, age: Duration) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"0123456789").unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_sweep_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("job-a").join("song - vocals.wav");
        let young = dir.path().join("job-b").join("song - drums.wav");
        write_aged(&old, 50 * HOUR);
        write_aged(&young, HOUR);

        let removed = RetentionManager::sweep(dir.path(), 48 * HOUR).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(young.exists());
        // Emptied job dir is gone, the root and the live one remain
        assert!(!dir.path().join("job-a").exists());
        assert!(dir.path().join("job-b").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_sweep_keeps_fresh_empty_job_dirs() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("stems-live").join("separated");
        let job_dir = dir.path().join("0b6f3b1e-52f1-4b8e-9c55-0d6b1f3f1a2b");
        fs::create_dir_all(&scratch).unwrap();
        fs::create_dir(&job_dir).unwrap();
        write_aged(&dir.path().join("stale/old.wav"), 50 * HOUR);

        assert_eq!(RetentionManager::sweep(dir.path(), 48 * HOUR).unwrap(), 1);
        assert!(scratch.exists());
        assert!(job_dir.exists());
        assert!(!dir.path().join("stale").exists());
    }

    #[test]
    fn test_sweep_keeps_dir_with_young_sibling() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir.path().join("job/old.wav"), 50 * HOUR);
        fs::create_dir_all(dir.path().join("job/separated")).unwrap();

        assert_eq!(RetentionManager::sweep(dir.path(), 48 * HOUR).unwrap(), 1);
        assert!(dir.path().join("job/separated").exists());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir.path().join("a.mp3"), 3 * HOUR);
        write_aged(&dir.path().join("nested/deeper/b.mp3"), 3 * HOUR);

        assert_eq!(RetentionManager::sweep(dir.path(), HOUR).unwrap(), 2);
        assert_eq!(RetentionManager::sweep(dir.path(), HOUR).unwrap(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sweep_missing_directory() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            RetentionManager::sweep(&dir.path().join("nope"), HOUR).unwrap(),
            0
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_sweep_does_not_follow_symlinks() {
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("precious.wav");
        write_aged(&target, 100 * HOUR);

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        RetentionManager::sweep(dir.path(), HOUR).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir.path().join("a.wav"), 2 * HOUR);
        write_aged(&dir.path().join("x/b.wav"), 5 * HOUR);

        let stats = RetentionManager::stats(dir.path());
        assert!(stats.exists);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_size_bytes, 20);
        assert!(stats.oldest_age >= 5 * HOUR - Duration::from_secs(60));

        let missing = RetentionManager::stats(&dir.path().join("missing"));
        assert_eq!(missing, DirectoryStats::default());
    }

    #[test]
    fn test_sweep_all_reports_per_directory() {
        let uploads = TempDir::new().unwrap();
        let outputs = TempDir::new().unwrap();
        write_aged(&uploads.path().join("u.mp3"), 3 * HOUR);
        write_aged(&outputs.path().join("o.wav"), 3 * HOUR);

        let manager = RetentionManager::new(ExitCleanupRegistry::new())
            .with_directory("uploads", uploads.path(), HOUR)
            .with_directory("outputs", outputs.path(), 10 * HOUR);

        let reports = manager.sweep_all();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].removed_files, 1);
        assert_eq!(reports[1].removed_files, 0);
        assert!(reports.iter().all(|r| r.status == SweepStatus::Success));
    }

    #[test]
    fn test_scoped_registers_with_registry() {
        let dir = TempDir::new().unwrap();
        let manager = RetentionManager::new(ExitCleanupRegistry::new());
        let path = dir.path().join("job");
        fs::create_dir(&path).unwrap();
        {
            let _scoped = manager.scoped(&path);
            assert!(manager.registry().contains(&path));
        }
        assert!(!path.exists());
        assert!(manager.registry().is_empty());
    }
}
