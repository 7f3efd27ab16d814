//! Configuration for the Warden state directory and engine tuning
//!
//! Everything Warden persists (backups, snapshots, the timeline) lives under a
//! single state directory. The remaining knobs tune payload compression,
//! identity-lock retries and collector parallelism.

use crate::compression::{CompressionAdapter, GzipCompressor, NoCompression};
use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use warden_retry::{backoff_policy, RetryPolicy};

/// Environment variable overriding the state directory
pub const ENV_STATE_DIR: &str = "WARDEN_STATE_DIR";
/// Environment variable overriding the gzip level (0 disables compression)
pub const ENV_COMPRESSION_LEVEL: &str = "WARDEN_COMPRESSION_LEVEL";
/// Environment variable overriding the lock retry attempt cap
pub const ENV_LOCK_ATTEMPTS: &str = "WARDEN_LOCK_ATTEMPTS";

/// Payload compression setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum CompressionSetting {
    Gzip { level: u32 },
    None,
}

impl CompressionSetting {
    pub fn build(&self) -> Arc<dyn CompressionAdapter> {
        match self {
            CompressionSetting::Gzip { level } => Arc::new(GzipCompressor::with_level(*level)),
            CompressionSetting::None => Arc::new(NoCompression::new()),
        }
    }
}

impl Default for CompressionSetting {
    fn default() -> Self {
        CompressionSetting::Gzip { level: 6 }
    }
}

/// Retry settings for per-identity lock contention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRetryConfig {
    pub max_attempts: usize,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl LockRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            backoff_policy(
                Duration::from_millis(self.initial_interval_ms),
                Duration::from_millis(self.max_interval_ms),
            ),
        )
    }
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 25,
            max_interval_ms: 500,
        }
    }
}

/// Top-level Warden configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Root of all persisted state
    pub state_dir: PathBuf,
    #[serde(default)]
    pub compression: CompressionSetting,
    #[serde(default)]
    pub lock_retry: LockRetryConfig,
    /// Upper bound on concurrently running collectors
    #[serde(default = "default_collector_threads")]
    pub max_collector_threads: usize,
}

fn default_collector_threads() -> usize {
    4
}

impl WardenConfig {
    /// Configuration rooted at `state_dir` with default tuning
    pub fn with_state_dir<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            compression: CompressionSetting::default(),
            lock_retry: LockRetryConfig::default(),
            max_collector_threads: default_collector_threads(),
        }
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var(ENV_COMPRESSION_LEVEL) {
            let level: u32 = level.trim().parse().map_err(|_| {
                WardenError::validation(format!("{ENV_COMPRESSION_LEVEL} must be 0-9, got {level}"))
            })?;
            config.compression = if level == 0 {
                CompressionSetting::None
            } else {
                CompressionSetting::Gzip { level }
            };
        }
        if let Ok(attempts) = std::env::var(ENV_LOCK_ATTEMPTS) {
            config.lock_retry.max_attempts = attempts.trim().parse().map_err(|_| {
                WardenError::validation(format!(
                    "{ENV_LOCK_ATTEMPTS} must be a positive integer, got {attempts}"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(WardenError::validation("state_dir cannot be empty"));
        }
        if let CompressionSetting::Gzip { level } = self.compression {
            if level > 9 {
                return Err(WardenError::validation(format!(
                    "gzip level must be 0-9, got {level}"
                )));
            }
        }
        if self.lock_retry.max_attempts == 0 {
            return Err(WardenError::validation(
                "lock_retry.max_attempts must be at least 1",
            ));
        }
        if self.lock_retry.initial_interval_ms > self.lock_retry.max_interval_ms {
            return Err(WardenError::validation(
                "lock_retry.initial_interval_ms cannot exceed max_interval_ms",
            ));
        }
        if self.max_collector_threads == 0 {
            return Err(WardenError::validation(
                "max_collector_threads must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_state_dir(base.join(".warden"))
    }
}
