//! Runner configuration.
//!
//! Every section deserializes with defaults, so a partial YAML file (or none at all)
//! yields a working runner.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;

// ============================================================================
// Runner Configuration
// ============================================================================

/// Top-level configuration for a [`Runner`](crate::runner::Runner).
///
/// # Example
///
/// ```yaml
/// worker:
///   worker_num: 20
///   queue_size: 50
/// user_context:
///   ttl_secs: 120
/// watcher:
///   base_dir: ./config/plugins
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub worker: WorkerConfig,
    pub user_context: UserContextConfig,
    pub watcher: WatcherConfig,
}

impl RunnerConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of long-running workers.
    pub worker_num: usize,
    /// Capacity of the job queue; enqueue blocks when it is full.
    pub queue_size: usize,
    /// Queue length reporting interval. `0` disables the reporter.
    pub supervise_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_num: 100,
            queue_size: 10,
            supervise_interval_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn supervise_interval(&self) -> Option<Duration> {
        (self.supervise_interval_secs > 0).then(|| Duration::from_secs(self.supervise_interval_secs))
    }
}

/// Limits of the per-sender conversation store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserContextConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// Background sweep interval. `0` leaves expiry to lookups only.
    pub sweep_interval_secs: u64,
}

impl Default for UserContextConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl UserContextConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Command and task configuration directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Files live under `<base_dir>/<bot type>/<identifier>.{yaml,yml,json}`.
    /// Without a base directory nothing is read and nothing is watched.
    pub base_dir: Option<PathBuf>,
    /// Quiet period a file must observe before its subscribers are notified.
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            debounce_ms: 200,
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ============================================================================
// Value overlay
// ============================================================================

/// Recursively merge `other` into `base`.
///
/// Objects merge key by key; any other value in `other` replaces the one in `base`.
pub fn merge_values(base: &mut serde_json::Value, other: &serde_json::Value) {
    match (base, other) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(other_map)) => {
            for (key, value) in other_map {
                if let Some(base_value) = base_map.get_mut(key) {
                    merge_values(base_value, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, other) => {
            *base = other.clone();
        }
    }
}
