//! Engine tuning knobs.
//!
//! [`EngineConfig`] is persisted as TOML (typically at
//! `~/.config/nodesync/engine.toml`). Every field has a default, so a
//! partial file only overrides what it names.
//!
//! ```ignore
//! use nodesync_core::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! assert_eq!(config.mutation_batch_size, 50);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Timing for a scheduled job, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTiming {
    /// Delay between a trigger and the run it causes.
    pub debounce_ms: u64,
    /// Repeat interval after a run; 0 disables repetition.
    pub interval_ms: u64,
}

impl JobTiming {
    pub const fn new(debounce_ms: u64, interval_ms: u64) -> Self {
        Self {
            debounce_ms,
            interval_ms,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

/// Configuration shared by the local replica and the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum mutations sent per push.
    pub mutation_batch_size: usize,

    /// Rejections after which a mutation is reverted.
    pub mutation_retry_ceiling: u32,

    /// Local read-modify-write attempts for `update_node`.
    pub local_update_retries: u32,

    /// Authoritative compare-and-swap attempts per mutation.
    pub cas_retries: u32,

    /// Maximum changes delivered per consumer batch.
    pub consumer_batch_size: usize,

    /// Accepted updates kept per entity after compaction.
    pub update_log_keep: usize,

    /// How long local delete tombstones are kept, in milliseconds.
    pub tombstone_retention_ms: i64,

    /// Upper bound of the outbox backoff after transport failures.
    pub max_backoff_ms: u64,

    pub mutations_sync: JobTiming,
    pub consumers_sync: JobTiming,
    pub tombstones_cleanup: JobTiming,
    pub consumers_poll: JobTiming,
    pub updates_compact: JobTiming,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mutation_batch_size: 50,
            mutation_retry_ceiling: 10,
            local_update_retries: 10,
            cas_retries: 5,
            consumer_batch_size: 50,
            update_log_keep: 0,
            tombstone_retention_ms: 7 * 24 * 60 * 60 * 1000,
            max_backoff_ms: 32 * 60 * 1000,
            mutations_sync: JobTiming::new(100, 60_000),
            consumers_sync: JobTiming::new(0, 60_000),
            tombstones_cleanup: JobTiming::new(1_000, 24 * 60 * 60 * 1000),
            consumers_poll: JobTiming::new(0, 30_000),
            updates_compact: JobTiming::new(1_000, 10 * 60 * 1000),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from `path`, or return defaults if it doesn't exist.
    pub fn load_from_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Get the config file path (~/.config/nodesync/engine.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nodesync").join("engine.toml"))
    }

    /// Load from the default location, or return defaults.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path().ok_or(SyncError::NoConfigDir)?;
        self.save_to(&path)
    }
}
