//! Configuration loading
//!
//! Config precedence: env vars > config file > defaults. The file has three
//! sections (`[store]`, `[pool]`, `[dispatch]`); all of them are optional.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::SharedClock;
use identity_pool::{Pool, PoolConfig};
use lease_store::{LeaseStore, StoreConfig};
use serde::Deserialize;

/// Overrides `store.path`.
pub const DB_PATH_ENV: &str = "IDENTITY_POOL_DB";

const DEFAULT_CONFIG_PATH: &str = "identity-pool.toml";

/// `[dispatch]` section: retry ceilings, cooldowns and the session cap.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Attempts on one identity before it is parked after transport errors.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    /// Attempts on one identity before it is parked after unknown responses.
    #[serde(default = "default_unknown_retries")]
    pub unknown_retries: u32,
    #[serde(default = "default_transport_cooldown_secs")]
    pub transport_cooldown_secs: u64,
    #[serde(default = "default_unknown_cooldown_secs")]
    pub unknown_cooldown_secs: u64,
    /// Open sessions across every client sharing one dispatcher.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Force a credential refresh instead of demoting on auth expiry.
    #[serde(default)]
    pub refresh_on_auth_expired: bool,
}

fn default_transport_retries() -> u32 {
    3
}

fn default_unknown_retries() -> u32 {
    3
}

fn default_transport_cooldown_secs() -> u64 {
    60
}

fn default_unknown_cooldown_secs() -> u64 {
    900
}

fn default_max_sessions() -> usize {
    16
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            transport_retries: default_transport_retries(),
            unknown_retries: default_unknown_retries(),
            transport_cooldown_secs: default_transport_cooldown_secs(),
            unknown_cooldown_secs: default_unknown_cooldown_secs(),
            max_sessions: default_max_sessions(),
            request_timeout_secs: default_request_timeout_secs(),
            refresh_on_auth_expired: false,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> common::Result<()> {
        if self.transport_retries == 0 {
            return Err(common::Error::Config(
                "dispatch.transport_retries must be greater than 0".into(),
            ));
        }
        if self.unknown_retries == 0 {
            return Err(common::Error::Config(
                "dispatch.unknown_retries must be greater than 0".into(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(common::Error::Config(
                "dispatch.max_sessions must be greater than 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "dispatch.request_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn transport_cooldown(&self) -> Duration {
        Duration::from_secs(self.transport_cooldown_secs)
    }

    pub fn unknown_cooldown(&self) -> Duration {
        Duration::from_secs(self.unknown_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Settings {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate every section.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut settings: Settings = toml::from_str(contents)?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(DB_PATH_ENV)
            && !path.trim().is_empty()
        {
            self.store.path = PathBuf::from(path.trim());
        }
        self.pool.apply_env_overrides();
    }

    pub fn validate(&self) -> common::Result<()> {
        self.store.validate()?;
        self.pool.validate()?;
        self.dispatch.validate()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Open the configured store and wrap it in a pool.
    pub fn open_pool(&self, clock: SharedClock) -> lease_store::Result<Arc<Pool>> {
        let store = LeaseStore::open(&self.store, clock)?;
        Ok(Arc::new(Pool::new(Arc::new(store), self.pool.clone())))
    }
}
