//! Configuration structures.
//!
//! Loading from files or the environment happens outside this crate; every
//! section has serde defaults so partial documents deserialize.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backing store configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Alarm retry policy.
    #[serde(default)]
    pub alarms: AlarmConfig,

    /// Idle instance eviction.
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Isolated-thread executor transport.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// How long a writer waits on a locked database before failing.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Alarm retry policy: exponential backoff `min(base * 2^retry, max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Upper bound for any single backoff.
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Retries after the initial invocation.
    pub max_retries: u32,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(64),
            max_retries: 6,
        }
    }
}

/// Idle instance eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Instances idle longer than this are dropped. `None` disables eviction.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,

    /// How often the eviction sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Isolated-thread executor transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// In-memory pipe buffer between initiator and executor thread.
    pub pipe_capacity: usize,

    /// How long commands wait for the executor to report ready.
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            pipe_capacity: 64 * 1024,
            init_timeout: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "alarms": {
                "retry_base_delay": "10ms",
                "retry_max_delay": "1s",
                "max_retries": 2,
            },
            "eviction": {
                "idle_timeout": "5m",
                "sweep_interval": "10s",
            },
        }))
        .unwrap();

        assert_eq!(config.alarms.retry_base_delay, Duration::from_millis(10));
        assert_eq!(config.alarms.max_retries, 2);
        assert_eq!(config.eviction.idle_timeout, Some(Duration::from_secs(300)));
        assert!(config.storage.path.is_none());
        assert_eq!(config.executor.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_partial_sections_fill_missing_fields() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "storage": {"path": "durable.db"},
            "alarms": {"max_retries": 3},
            "executor": {"init_timeout": "2s"},
            "observability": {"json_logs": true},
        }))
        .unwrap();

        assert_eq!(config.storage.path, Some(PathBuf::from("durable.db")));
        assert_eq!(config.storage.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.alarms.max_retries, 3);
        assert_eq!(config.alarms.retry_base_delay, Duration::from_secs(2));
        assert_eq!(config.executor.init_timeout, Duration::from_secs(2));
        assert_eq!(config.executor.pipe_capacity, 64 * 1024);
        assert_eq!(config.observability.log_level, "info");
        assert!(config.observability.json_logs);
    }
}
