//! Integration tests for disk retention and exit cleanup

use mtools_svc::services::cleanup_scheduler::sweep_now;
use mtools_svc::services::{
    CleanupScheduler, ExitCleanupRegistry, RetentionManager, SweepStatus,
};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);

fn write_aged(path: &Path, age: Duration) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, b"stem").unwrap();
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[tokio::test]
async fn test_scheduler_sweeps_at_startup() {
    let outputs = TempDir::new().unwrap();
    let expired = outputs.path().join("job-1").join("song - vocals.mp3");
    let fresh = outputs.path().join("job-2").join("song - drums.mp3");
    write_aged(&expired, 30 * HOUR);
    write_aged(&fresh, HOUR);

    let manager = RetentionManager::new(ExitCleanupRegistry::new())
        .with_directory("outputs", outputs.path(), 24 * HOUR);
    let scheduler = CleanupScheduler::start(manager, HOUR);
    assert!(scheduler.is_running());

    // The first tick fires immediately
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while expired.exists() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    scheduler.shutdown().await;
    assert!(!expired.exists());
    assert!(fresh.exists());
    assert!(!outputs.path().join("job-1").exists());
}

#[tokio::test]
async fn test_manual_sweep_reports_each_directory() {
    let uploads = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    write_aged(&uploads.path().join("upload-a.mp3"), 2 * HOUR);
    write_aged(&temp.path().join("stems-x/separated/vocals.wav"), 2 * HOUR);

    let manager = RetentionManager::new(ExitCleanupRegistry::new())
        .with_directory("uploads", uploads.path(), 24 * HOUR)
        .with_directory("temp", temp.path(), HOUR)
        .with_directory("outputs", uploads.path().join("never-created"), HOUR);

    let reports = sweep_now(&manager).await;
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.status == SweepStatus::Success));
    assert_eq!(reports[0].removed_files, 0);
    assert_eq!(reports[1].removed_files, 1);
    assert_eq!(reports[2].removed_files, 0);
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);

    // Nothing left to do on a second pass
    let again = sweep_now(&manager).await;
    assert!(again.iter().all(|r| r.removed_files == 0));
}

#[tokio::test]
async fn test_sweep_of_a_file_root_is_an_error_report() {
    let dir = TempDir::new().unwrap();
    let not_a_dir = dir.path().join("plain");
    fs::write(&not_a_dir, b"x").unwrap();

    let manager =
        RetentionManager::new(ExitCleanupRegistry::new()).with_directory("outputs", &not_a_dir, HOUR);
    let reports = sweep_now(&manager).await;
    assert_eq!(reports[0].status, SweepStatus::Error);
    assert!(reports[0].error.is_some());
    assert!(not_a_dir.exists());
}

#[test]
fn test_registry_drain_removes_registered_paths() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("upload-1.wav");
    let job = dir.path().join("stems-1");
    fs::write(&file, b"x").unwrap();
    write_aged(&job.join("separated/vocals.wav"), Duration::ZERO);

    let registry = ExitCleanupRegistry::new();
    let manager = RetentionManager::new(registry.clone());
    manager.register_for_exit_cleanup(&file);
    manager.register_for_exit_cleanup(&job);
    manager.register_for_exit_cleanup(dir.path().join("already-gone"));

    assert_eq!(registry.drain(), 2);
    assert!(!file.exists());
    assert!(!job.exists());
    assert!(registry.is_empty());
    assert_eq!(registry.drain(), 0);
}

#[test]
fn test_disarmed_scope_survives() {
    let dir = TempDir::new().unwrap();
    let manager = RetentionManager::new(ExitCleanupRegistry::new());
    let job = dir.path().join("job");
    fs::create_dir(&job).unwrap();

    let kept = manager.scoped(&job).disarm();
    assert_eq!(kept, job);
    assert!(job.exists());
    assert!(!manager.registry().contains(&job));
}
