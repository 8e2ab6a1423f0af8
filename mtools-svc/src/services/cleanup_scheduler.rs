//! Periodic retention sweeps
//!
//! One background task sweeps all managed directories at startup and then
//! once per interval. Sweeps run on the blocking pool so request workers
//! never wait on filesystem walks.

use crate::services::retention_manager::{RetentionManager, SweepReport};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handle to the running sweep task
#[derive(Debug)]
pub struct CleanupScheduler {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Spawn the sweep task on the current runtime
    pub fn start(manager: RetentionManager, interval: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let interval = interval.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            info!(
                interval_hours = interval.as_secs_f64() / 3600.0,
                "Started cleanup scheduler"
            );

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                info!("Starting periodic cleanup...");
                let sweep_manager = manager.clone();
                match tokio::task::spawn_blocking(move || sweep_manager.sweep_all()).await {
                    Ok(reports) => {
                        let total: usize = reports.iter().map(|r| r.removed_files).sum();
                        info!(removed = total, "Periodic cleanup completed");
                    }
                    Err(e) => error!("Periodic cleanup task failed: {}", e),
                }
            }

            info!("Cleanup scheduler stopped");
        });

        Self {
            cancel_token,
            handle,
        }
    }

    /// Stop ticking and wait for an in-flight sweep to finish
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.handle.await {
            error!("Cleanup scheduler ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Run one sweep of every managed directory off the async workers
pub async fn sweep_now(manager: &RetentionManager) -> Vec<SweepReport> {
    let manager = manager.clone();
    match tokio::task::spawn_blocking(move || manager.sweep_all()).await {
        Ok(reports) => reports,
        Err(e) => {
            error!("Manual cleanup task failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::exit_cleanup::ExitCleanupRegistry;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_first_tick_sweeps_and_shutdown_joins() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("stale.wav");
        std::fs::write(&old, b"x").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        let manager = RetentionManager::new(ExitCleanupRegistry::new()).with_directory(
            "temp",
            dir.path(),
            Duration::from_secs(3600),
        );
        let scheduler = CleanupScheduler::start(manager, Duration::from_secs(3600));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while old.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!old.exists());

        assert!(scheduler.is_running());
        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("scheduler did not stop");
    }
}
