//! Memory sampling and admission decisions
//!
//! Snapshots are point-in-time: nothing here caches a reading beyond the
//! decision it was taken for. A failed read yields a zeroed snapshot, which
//! the admission check treats as "no memory available".

use mtools_common::config::MemoryConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// System-wide memory figures in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemory {
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    /// System memory, `None` if it cannot be read
    fn system(&self) -> Option<SystemMemory>;

    /// Resident set size of `pid` in bytes, `None` if unknown or exited
    fn process_rss(&self, pid: u32) -> Option<u64>;

    /// PID of this process
    fn current_pid(&self) -> Option<u32>;
}

/// `sysinfo`-backed probe
pub struct SysinfoProbe {
    sys: Mutex<System>,
    pid: Option<u32>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok().map(|p| p.as_u32()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn system(&self) -> Option<SystemMemory> {
        let mut sys = self.sys.lock().ok()?;
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        Some(SystemMemory {
            total,
            available: sys.available_memory(),
            used: sys.used_memory(),
        })
    }

    fn process_rss(&self, pid: u32) -> Option<u64> {
        let mut sys = self.sys.lock().ok()?;
        let pid = Pid::from_u32(pid);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        sys.process(pid).map(|p| p.memory())
    }

    fn current_pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Probe returning values set by the caller
///
/// Used where real host memory must not influence the outcome, such as
/// tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticMemoryProbe {
    total: AtomicU64,
    available: AtomicU64,
    process_rss: AtomicU64,
}

impl StaticMemoryProbe {
    /// All figures in MB; `total_mb == 0` simulates a failed read
    pub fn new(total_mb: u64, available_mb: u64, process_rss_mb: u64) -> Self {
        let probe = Self::default();
        probe.set(total_mb, available_mb, process_rss_mb);
        probe
    }

    pub fn set(&self, total_mb: u64, available_mb: u64, process_rss_mb: u64) {
        self.total.store(total_mb * BYTES_PER_MB, Ordering::SeqCst);
        self.available.store(available_mb * BYTES_PER_MB, Ordering::SeqCst);
        self.process_rss.store(process_rss_mb * BYTES_PER_MB, Ordering::SeqCst);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn system(&self) -> Option<SystemMemory> {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return None;
        }
        let available = self.available.load(Ordering::SeqCst);
        Some(SystemMemory {
            total,
            available,
            used: total.saturating_sub(available),
        })
    }

    fn process_rss(&self, _pid: u32) -> Option<u64> {
        Some(self.process_rss.load(Ordering::SeqCst))
    }

    fn current_pid(&self) -> Option<u32> {
        Some(std::process::id())
    }
}

/// Point-in-time memory reading, in MB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub used_percent: f64,
    pub process_rss_mb: u64,
}

impl MemorySnapshot {
    /// A zeroed snapshot means the reading failed
    pub fn is_unknown(&self) -> bool {
        self.total_mb == 0
    }
}

/// Classes of heavy operation, each with its own memory multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Separation,
    Transcode,
    Download,
    Other,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Separation => "stem_separation",
            OperationClass::Transcode => "format_conversion",
            OperationClass::Download => "remote_download",
            OperationClass::Other => "other",
        }
    }
}

/// Answers "is there room for this operation?"
#[derive(Clone)]
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    config: MemoryConfig,
}

impl MemoryGovernor {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: MemoryConfig) -> Self {
        Self { probe, config }
    }

    /// Governor over the host's real memory
    pub fn system(config: MemoryConfig) -> Self {
        Self::new(Arc::new(SysinfoProbe::new()), config)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Sample system and process memory now
    pub fn snapshot(&self) -> MemorySnapshot {
        let Some(system) = self.probe.system() else {
            warn!("Error getting memory stats, reporting zeroed snapshot");
            return MemorySnapshot::default();
        };

        let process_rss = self
            .probe
            .current_pid()
            .and_then(|pid| self.probe.process_rss(pid))
            .unwrap_or(0);

        MemorySnapshot {
            total_mb: system.total / BYTES_PER_MB,
            available_mb: system.available / BYTES_PER_MB,
            used_mb: system.used / BYTES_PER_MB,
            used_percent: (system.used as f64 / system.total as f64 * 1000.0).round() / 10.0,
            process_rss_mb: process_rss / BYTES_PER_MB,
        }
    }

    /// Estimated memory for running `operation_class` over `file_size` bytes
    pub fn estimate(&self, file_size: u64, operation_class: OperationClass) -> u64 {
        let multiplier = match operation_class {
            OperationClass::Separation => self.config.separation_multiplier,
            OperationClass::Transcode => self.config.transcode_multiplier,
            OperationClass::Download => self.config.download_multiplier,
            OperationClass::Other => self.config.default_multiplier,
        };
        let file_mb = file_size as f64 / BYTES_PER_MB as f64;
        let estimate = (file_mb * multiplier).ceil() as u64;
        estimate.max(self.config.min_estimate_mb)
    }

    /// Whether `required_mb` fits both system and process headroom
    pub fn admit(&self, required_mb: u64) -> bool {
        let stats = self.snapshot();

        if stats.is_unknown() {
            warn!(required_mb, "Memory stats unavailable, denying admission");
            return false;
        }

        if stats.available_mb < required_mb {
            warn!(
                available_mb = stats.available_mb,
                required_mb,
                "Insufficient system memory"
            );
            return false;
        }

        if stats.process_rss_mb + required_mb > self.config.process_limit_mb {
            warn!(
                process_mb = stats.process_rss_mb,
                required_mb,
                limit_mb = self.config.process_limit_mb,
                "Process memory limit exceeded"
            );
            return false;
        }

        true
    }

    /// Whether this process is above its warning threshold
    pub fn is_under_pressure(&self) -> bool {
        let stats = self.snapshot();
        let pressured = stats.process_rss_mb > self.config.process_warning_mb;
        if pressured {
            warn!(
                process_mb = stats.process_rss_mb,
                threshold_mb = self.config.process_warning_mb,
                "Memory usage warning"
            );
        }
        pressured
    }

    /// RSS of another process in MB
    pub fn process_rss_mb(&self, pid: u32) -> Option<u64> {
        self.probe.process_rss(pid).map(|b| b / BYTES_PER_MB)
    }

    /// Best-effort post-release hygiene
    ///
    /// Rust has no collector to nudge; this re-samples memory so the next
    /// admission sees fresh figures and records the post-release level.
    pub fn reclaim_hint(&self) {
        let snap = self.snapshot();
        debug!(
            available_mb = snap.available_mb,
            process_mb = snap.process_rss_mb,
            "Post-release memory sample"
        );
    }
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
