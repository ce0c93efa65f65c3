//! # Configuration Management
//!
//! Handles all configuration for Kura components. Every section has a
//! `Default`, and every struct is `#[serde(default)]`, so a TOML file only
//! needs to name the values it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub coalesce: CoalesceConfig,
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Configuration {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        let s = &self.storage;
        check(s.max_concurrent_ops > 0, "storage.max_concurrent_ops must be > 0")?;
        check(s.read_ahead_bytes > 0, "storage.read_ahead_bytes must be > 0")?;
        check(s.write_buffer_bytes > 0, "storage.write_buffer_bytes must be > 0")?;
        check(
            s.write_buffer_bytes as u64 <= s.total_storage_bytes,
            "storage.write_buffer_bytes exceeds storage.total_storage_bytes",
        )?;
        check(
            !s.data_directories.primary.as_os_str().is_empty(),
            "storage.data_directories.primary must be set",
        )?;
        check(self.cache.shards > 0, "cache.shards must be > 0")?;
        check(
            self.coalesce.threshold_bytes <= s.write_buffer_bytes,
            "coalesce.threshold_bytes exceeds storage.write_buffer_bytes",
        )?;
        check(
            self.coalesce.max_delay_ms >= s.coalesce_window_ms,
            "coalesce.max_delay_ms must be >= storage.coalesce_window_ms",
        )?;
        check(
            self.scheduler.read_weight > 0 && self.scheduler.write_weight > 0,
            "scheduler weights must be > 0",
        )?;
        Ok(())
    }
}

fn check(ok: bool, message: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Configuration {
            message: message.to_string(),
        })
    }
}

/// Storage configuration: the options the host sets directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub total_storage_bytes: u64,
    pub read_ahead_bytes: usize,
    pub write_buffer_bytes: usize,
    pub max_concurrent_ops: usize,
    pub cache_max_bytes: usize,
    pub coalesce_window_ms: u64,
    /// Files at or above this size are streamed in read-ahead sized chunks.
    pub stream_threshold_bytes: u64,
    /// `sync_data` the temp file before renaming it into place.
    pub sync_writes: bool,
    pub data_directories: DataDirectories,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            total_storage_bytes: 10 * 1024 * 1024 * 1024, // 10GB
            read_ahead_bytes: MIB,
            write_buffer_bytes: 4 * MIB,
            max_concurrent_ops: 32,
            cache_max_bytes: 64 * MIB,
            coalesce_window_ms: 100,
            stream_threshold_bytes: 10 * MIB as u64,
            sync_writes: false,
            data_directories: DataDirectories::default(),
        }
    }
}

impl StorageConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDirectories {
    pub primary: PathBuf,
    pub cache: PathBuf,
    pub logs: PathBuf,
    pub temp: PathBuf,
}

impl Default for DataDirectories {
    fn default() -> Self {
        Self {
            primary: PathBuf::from("./data"),
            cache: PathBuf::from("./data/cache"),
            logs: PathBuf::from("./data/logs"),
            temp: PathBuf::from("./data/tmp"),
        }
    }
}

impl DataDirectories {
    /// Same layout rooted at `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            primary: root.to_path_buf(),
            cache: root.join("cache"),
            logs: root.join("logs"),
            temp: root.join("tmp"),
        }
    }

    pub fn all(&self) -> [&Path; 4] {
        [&self.primary, &self.cache, &self.logs, &self.temp]
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub small_capacity: usize,
    pub medium_capacity: usize,
    pub large_capacity: usize,
    /// Zero blocks on release so stale data never crosses callers.
    pub zero_on_release: bool,
    /// Pre-allocate every tier up to its capacity at startup.
    pub prime_on_start: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_capacity: 256,
            medium_capacity: 64,
            large_capacity: 8,
            zero_on_release: true,
            prime_on_start: false,
        }
    }
}

/// Read cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub shards: usize,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: 16,
            ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 30 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Write coalescing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    pub enabled: bool,
    /// Writes strictly below this size are coalesced.
    pub threshold_bytes: usize,
    /// Upper bound on how long a buffer may be held open by re-arming.
    pub max_delay_ms: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 64 * KIB,
            max_delay_ms: 1000,
        }
    }
}

impl CoalesceConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub read_queue_depth: usize,
    pub write_queue_depth: usize,
    pub priority_queue_depth: usize,
    pub read_weight: u32,
    pub write_weight: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            read_queue_depth: 256,
            write_queue_depth: 256,
            priority_queue_depth: 64,
            read_weight: 2,
            write_weight: 1,
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub report_interval_ms: u64,
    pub read_latency_warn_ms: f64,
    pub write_latency_warn_ms: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_ms: 10_000,
            read_latency_warn_ms: 50.0,
            write_latency_warn_ms: 200.0,
        }
    }
}

impl MetricsConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}
