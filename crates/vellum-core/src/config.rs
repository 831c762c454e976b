use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration (loaded from vellum.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VellumConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the three durable stores
    /// (operations.log, notes.json, devices.json)
    pub data_dir: PathBuf,
    /// Shared directory acting as the remote replica (optional; the daemon
    /// refuses to start sync without one)
    pub remote_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Device name (defaults to hostname)
    pub device_name: Option<String>,
    /// Worker count for the sync pool (0 = cpu_count)
    pub workers: usize,
    /// Attempts before an operation is marked Failed (default: 8)
    pub max_attempts: u32,
    /// First retry delay in milliseconds (default: 2000)
    pub retry_base_ms: u64,
    /// Retry delay ceiling in milliseconds (default: 300000 = 5 min)
    pub retry_cap_ms: u64,
    /// Remote call timeout in seconds (default: 30)
    pub request_timeout_secs: u64,
    /// Seconds a device may stay silent before it is excluded from the GC
    /// watermark and flagged for full resync (default: 30 days)
    pub freshness_window_secs: u64,
    /// Seconds between scheduler sync rounds (default: 5)
    pub sync_interval_secs: u64,
    /// Maximum payload size accepted at enqueue (default: 1 MiB)
    pub max_payload_bytes: usize,
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Retry delay for the given attempt number (0-based): base·2ⁿ, capped.
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.min(32);
        self.retry_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_cap_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.local/share/vellum"),
            remote_dir: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            workers: 0,
            max_attempts: 8,
            retry_base_ms: 2_000,
            retry_cap_ms: 300_000,
            request_timeout_secs: 30,
            freshness_window_secs: 30 * 24 * 3600,
            sync_interval_secs: 5,
            max_payload_bytes: 1024 * 1024,
        }
    }
}
