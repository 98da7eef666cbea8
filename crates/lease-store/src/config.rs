//! Store location and contention settings

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// `[store]` section of the pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Attempts per statement before a busy database is reported.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
    #[serde(default = "default_busy_backoff_min_ms")]
    pub busy_backoff_min_ms: u64,
    #[serde(default = "default_busy_backoff_max_ms")]
    pub busy_backoff_max_ms: u64,
    /// SQLite's own busy wait. Kept short: it blocks while the in-process
    /// lock is held.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_path() -> PathBuf {
    PathBuf::from("identities.db")
}

fn default_busy_retries() -> u32 {
    10
}

fn default_busy_backoff_min_ms() -> u64 {
    500
}

fn default_busy_backoff_max_ms() -> u64 {
    1000
}

fn default_busy_timeout_ms() -> u64 {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            busy_retries: default_busy_retries(),
            busy_backoff_min_ms: default_busy_backoff_min_ms(),
            busy_backoff_max_ms: default_busy_backoff_max_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.busy_retries == 0 {
            return Err(common::Error::Config(
                "store.busy_retries must be greater than 0".into(),
            ));
        }
        if self.busy_backoff_min_ms > self.busy_backoff_max_ms {
            return Err(common::Error::Config(format!(
                "store.busy_backoff_min_ms ({}) must not exceed busy_backoff_max_ms ({})",
                self.busy_backoff_min_ms, self.busy_backoff_max_ms
            )));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
