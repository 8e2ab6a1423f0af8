//! Bootstrap configuration loading and validation
//!
//! Configuration is read once at startup and is read-only afterwards.
//!
//! # Config file resolution
//!
//! 1. Command-line argument (highest priority)
//! 2. `MTOOLS_CONFIG` environment variable
//! 3. Platform config directory (`~/.config/mtools/config.toml` on Linux)
//! 4. Built-in defaults (no file)
//!
//! A missing config file is not fatal: a warning is logged and defaults are
//! used. A file that exists but fails to parse, or that contains unknown keys,
//! is a configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MTOOLS_CONFIG";

/// Stems a separation job may transcode, one after another
pub const MAX_STEMS_PER_JOB: u32 = 4;

/// Root of the service configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Directory layout
///
/// The three roots must be distinct and must not contain one another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            upload_dir: base.join("uploads"),
            output_dir: base.join("outputs"),
            temp_dir: base.join("temp"),
        }
    }
}

impl StorageConfig {
    /// All storage roots, labelled
    pub fn directories(&self) -> [(&'static str, &Path); 3] {
        [
            ("uploads", self.upload_dir.as_path()),
            ("outputs", self.output_dir.as_path()),
            ("temp", self.temp_dir.as_path()),
        ]
    }
}

/// Upload and concurrency limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    pub max_upload_mb: u64,
    pub chunk_size_bytes: usize,
    pub max_concurrent_operations: usize,
    /// How long a request may wait for a free slot before being denied (0 = never wait)
    pub admission_wait_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: 100,
            chunk_size_bytes: 8192,
            max_concurrent_operations: 2,
            admission_wait_secs: 0,
        }
    }
}

impl LimitsConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

/// Retention horizons and sweep interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetentionConfig {
    pub file_retention_hours: u64,
    pub cleanup_interval_hours: u64,
    /// Optional shorter horizon for the temp directory
    pub temp_retention_hours: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            file_retention_hours: 48,
            cleanup_interval_hours: 24,
            temp_retention_hours: None,
        }
    }
}

impl RetentionConfig {
    /// Policy applied to uploads and outputs
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: hours(self.file_retention_hours),
            sweep_interval: hours(self.cleanup_interval_hours),
        }
    }

    /// Policy applied to the temp directory
    pub fn temp_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: hours(self.temp_retention_hours.unwrap_or(self.file_retention_hours)),
            sweep_interval: hours(self.cleanup_interval_hours),
        }
    }
}

/// Retention horizon and sweep cadence for one directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

/// Memory ceilings and per-operation estimate multipliers
///
/// The multipliers are heuristics relating input size to tool memory use,
/// not measured bounds. Tune them per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    /// Ceiling on this process's RSS plus an admitted operation's estimate
    pub process_limit_mb: u64,
    /// RSS above which the service reports memory pressure
    pub process_warning_mb: u64,
    /// Ceiling on a single supervised child's RSS
    pub subprocess_limit_mb: u64,
    pub check_interval_ms: u64,
    pub min_estimate_mb: u64,
    pub separation_multiplier: f64,
    pub transcode_multiplier: f64,
    pub download_multiplier: f64,
    pub default_multiplier: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            process_limit_mb: 4096,
            process_warning_mb: 3072,
            subprocess_limit_mb: 6144,
            check_interval_ms: 1000,
            min_estimate_mb: 64,
            separation_multiplier: 4.0,
            transcode_multiplier: 2.0,
            download_multiplier: 2.0,
            default_multiplier: 2.0,
        }
    }
}

/// External tool programs and their wall-clock budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolsConfig {
    pub python_program: String,
    pub transcoder_program: String,
    pub downloader_program: String,
    pub separation_timeout_secs: u64,
    pub transcode_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_captured_output_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            python_program: "python3".to_string(),
            transcoder_program: "ffmpeg".to_string(),
            downloader_program: "yt-dlp".to_string(),
            separation_timeout_secs: 1800,
            transcode_timeout_secs: 300,
            download_timeout_secs: 600,
            max_captured_output_bytes: 64 * 1024,
        }
    }
}

impl ToolsConfig {
    /// Every tool timeout, labelled
    pub fn timeouts(&self) -> [(&'static str, Duration); 3] {
        [
            ("separation", Duration::from_secs(self.separation_timeout_secs)),
            ("transcode", Duration::from_secs(self.transcode_timeout_secs)),
            ("download", Duration::from_secs(self.download_timeout_secs)),
        ]
    }

    /// Longest wall-clock time each job can keep its scratch files alive
    ///
    /// A stem job waits for admission, separates, then transcodes every stem
    /// in turn. A download job waits for admission, then downloads.
    pub fn job_budgets(&self, admission_wait: Duration) -> [(&'static str, Duration); 2] {
        let secs = Duration::from_secs;
        [
            (
                "stem separation",
                admission_wait
                    + secs(self.separation_timeout_secs)
                    + secs(self.transcode_timeout_secs) * MAX_STEMS_PER_JOB,
            ),
            ("download", admission_wait + secs(self.download_timeout_secs)),
        ]
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Optional API-key access control for `/api/v1`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    pub require_api_key: bool,
    /// Keys accepted in the `X-API-Key` header
    pub api_keys: Vec<String>,
}

impl TomlConfig {
    /// Resolve and load the config file, falling back to defaults
    ///
    /// Returns the parsed configuration and the file it came from, if any.
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let candidate = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .or_else(|| dirs::config_dir().map(|d| d.join("mtools").join("config.toml")));

        match candidate {
            Some(path) if path.exists() => {
                let config = Self::from_file(&path)?;
                info!("Loaded configuration from {}", path.display());
                Ok((config, Some(path)))
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using built-in defaults",
                    path.display()
                );
                Ok((Self::default(), None))
            }
            None => {
                warn!("Could not determine config directory, using built-in defaults");
                Ok((Self::default(), None))
            }
        }
    }

    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Reject configurations the service cannot run safely with
    ///
    /// Checks:
    /// - storage roots are distinct and not nested in one another
    /// - limits and intervals are non-zero
    /// - every tool timeout is non-zero
    /// - each job's worst-case duration (admission wait plus every tool run
    ///   it makes) is strictly shorter than the retention horizon of the
    ///   directories jobs write to (temp and outputs)
    pub fn validate(&self) -> Result<()> {
        let dirs = self.storage.directories();
        for (i, (name_a, a)) in dirs.iter().enumerate() {
            for (name_b, b) in dirs.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(Error::Config(format!(
                        "storage.{} and storage.{} must be distinct, non-nested directories",
                        dir_key(name_a),
                        dir_key(name_b)
                    )));
                }
            }
        }

        if self.limits.max_upload_mb == 0 {
            return Err(Error::Config("limits.max_upload_mb must be > 0".to_string()));
        }
        if self.limits.chunk_size_bytes == 0 || self.limits.chunk_size_bytes > 1024 * 1024 {
            return Err(Error::Config(
                "limits.chunk_size_bytes must be between 1 and 1048576".to_string(),
            ));
        }
        if self.limits.max_concurrent_operations == 0 {
            return Err(Error::Config(
                "limits.max_concurrent_operations must be > 0".to_string(),
            ));
        }
        if self.retention.cleanup_interval_hours == 0 {
            return Err(Error::Config(
                "retention.cleanup_interval_hours must be > 0".to_string(),
            ));
        }
        if self.auth.require_api_key && self.auth.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(Error::Config(
                "auth.require_api_key is set but auth.api_keys is empty".to_string(),
            ));
        }
        if self.memory.check_interval_ms == 0 {
            return Err(Error::Config("memory.check_interval_ms must be > 0".to_string()));
        }

        let multipliers = [
            ("separation_multiplier", self.memory.separation_multiplier),
            ("transcode_multiplier", self.memory.transcode_multiplier),
            ("download_multiplier", self.memory.download_multiplier),
            ("default_multiplier", self.memory.default_multiplier),
        ];
        for (key, value) in multipliers {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!("memory.{} must be a positive number", key)));
            }
        }

        let horizon = self
            .retention
            .policy()
            .max_age
            .min(self.retention.temp_policy().max_age);
        for (tool, timeout) in self.tools.timeouts() {
            if timeout.is_zero() {
                return Err(Error::Config(format!("tools.{}_timeout_secs must be > 0", tool)));
            }
        }
        let admission_wait = Duration::from_secs(self.limits.admission_wait_secs);
        for (job, budget) in self.tools.job_budgets(admission_wait) {
            if budget >= horizon {
                return Err(Error::Config(format!(
                    "a {} job can run {}s, which must be shorter than the retention horizon ({}s)",
                    job,
                    budget.as_secs(),
                    horizon.as_secs()
                )));
            }
        }

        Ok(())
    }
}

/// Write a config file (used to seed a default config)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn dir_key(label: &str) -> &'static str {
    match label {
        "uploads" => "upload_dir",
        "outputs" => "output_dir",
        _ => "temp_dir",
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mtools"))
        .unwrap_or_else(|| PathBuf::from("./mtools_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TomlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_upload_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            [limits]
            max_upload_mb = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_upload_mb, 50);
        assert_eq!(config.limits.chunk_size_bytes, 8192);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result = TomlConfig::from_toml_str(
            r#"
            [tools]
            extra_args = "--no-check-certificate"
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_timeout_longer_than_retention_rejected() {
        let mut config = TomlConfig::default();
        config.retention.temp_retention_hours = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retention horizon"));

        let mut config = TomlConfig::default();
        config.retention.file_retention_hours = 1;
        config.tools.separation_timeout_secs = 3600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_section() {
        let config = TomlConfig::from_toml_str(
            r#"
            [auth]
            require_api_key = true
            api_keys = ["k1", "k2"]
            "#,
        )
        .unwrap();
        assert!(config.auth.require_api_key);
        assert_eq!(config.auth.api_keys, vec!["k1".to_string(), "k2".to_string()]);
        assert!(config.validate().is_ok());

        let mut config = TomlConfig::default();
        config.auth.require_api_key = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_keys"));
    }

    #[test]
    fn test_whole_job_budget_checked_against_retention() {
        // Each timeout alone fits in one hour, the stem job as a whole does not
        let mut config = TomlConfig::default();
        config.retention.file_retention_hours = 1;
        config.tools.separation_timeout_secs = 1800;
        config.tools.transcode_timeout_secs = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stem separation"));

        // Admission wait counts toward the download budget
        let mut config = TomlConfig::default();
        config.retention.file_retention_hours = 1;
        config.tools.separation_timeout_secs = 600;
        config.tools.transcode_timeout_secs = 60;
        config.tools.download_timeout_secs = 3000;
        config.limits.admission_wait_secs = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("download"));

        config.limits.admission_wait_secs = 300;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_storage_rejected() {
        let mut config = TomlConfig::default();
        config.storage.temp_dir = config.storage.output_dir.join("tmp");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output_dir"));
    }

    #[test]
    fn test_temp_policy_override() {
        let retention = RetentionConfig {
            file_retention_hours: 48,
            cleanup_interval_hours: 6,
            temp_retention_hours: Some(2),
        };
        assert_eq!(retention.policy().max_age, Duration::from_secs(48 * 3600));
        assert_eq!(retention.temp_policy().max_age, Duration::from_secs(2 * 3600));
        assert_eq!(retention.temp_policy().sweep_interval, Duration::from_secs(6 * 3600));
    }
}
