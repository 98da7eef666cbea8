//! Pool admission, cooldown and refresh settings
//!
//! Deserialized from the `[pool]` section. Per-operation policies live under
//! `[pool.operations.<name>]`; operations without an entry use the default
//! lock window.

use std::collections::BTreeMap;
use std::time::Duration;

use lease_store::Operation;
use serde::Deserialize;

/// Forces fail-fast admission when set to a truthy value.
pub const RAISE_WHEN_NO_IDENTITY_ENV: &str = "POOL_RAISE_WHEN_NO_IDENTITY";

/// What `acquire` does when no identity is eligible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Poll until an identity frees up (or `acquire_timeout_secs` passes).
    #[default]
    Wait,
    /// Return `PoolExhausted` immediately.
    FailFast,
}

/// Cooldown policy for one operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationPolicy {
    /// Fixed lock duration stamped at reservation.
    #[serde(default)]
    pub lock_secs: Option<u64>,
    /// Load-spreading lock: `|Normal(mean, 0.15 × mean)|` seconds.
    #[serde(default)]
    pub spread_mean_secs: Option<f64>,
    /// The lock is a minimum spacing between uses of one identity and
    /// survives a successful release.
    #[serde(default)]
    pub pacing: bool,
}

/// Resolved lock policy for an operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockPolicy {
    Fixed(Duration),
    Spread { mean_secs: f64 },
}

/// `[pool]` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub admission: AdmissionMode,
    /// 0 waits forever.
    #[serde(default)]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_lock_secs")]
    pub default_lock_secs: u64,
    #[serde(default = "default_refresh_threshold_low")]
    pub refresh_threshold_low: u64,
    #[serde(default = "default_refresh_threshold_high")]
    pub refresh_threshold_high: u64,
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
    /// Credential keys that must all be present for a new identity to start
    /// active. Empty means any non-empty material qualifies.
    #[serde(default)]
    pub activation_keys: Vec<String>,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationPolicy>,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_lease_ttl_secs() -> u64 {
    1800
}

fn default_lock_secs() -> u64 {
    900
}

fn default_refresh_threshold_low() -> u64 {
    15
}

fn default_refresh_threshold_high() -> u64 {
    30
}

fn default_refresh_concurrency() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            admission: AdmissionMode::default(),
            acquire_timeout_secs: 0,
            lease_ttl_secs: default_lease_ttl_secs(),
            default_lock_secs: default_lock_secs(),
            refresh_threshold_low: default_refresh_threshold_low(),
            refresh_threshold_high: default_refresh_threshold_high(),
            refresh_concurrency: default_refresh_concurrency(),
            activation_keys: Vec::new(),
            operations: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> common::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(common::Error::Config(
                "pool.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.lease_ttl_secs == 0 {
            return Err(common::Error::Config(
                "pool.lease_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.refresh_threshold_high == 0
            || self.refresh_threshold_low > self.refresh_threshold_high
        {
            return Err(common::Error::Config(format!(
                "pool.refresh_threshold range [{}, {}) is invalid",
                self.refresh_threshold_low, self.refresh_threshold_high
            )));
        }
        if self.refresh_concurrency == 0 {
            return Err(common::Error::Config(
                "pool.refresh_concurrency must be greater than 0".into(),
            ));
        }
        for (name, policy) in &self.operations {
            Operation::new(name.as_str()).map_err(|_| {
                common::Error::Config(format!("pool.operations: invalid operation name {name:?}"))
            })?;
            if policy.lock_secs.is_some() && policy.spread_mean_secs.is_some() {
                return Err(common::Error::Config(format!(
                    "pool.operations.{name}: lock_secs and spread_mean_secs are mutually exclusive"
                )));
            }
            if let Some(mean) = policy.spread_mean_secs
                && !(mean.is_finite() && mean > 0.0)
            {
                return Err(common::Error::Config(format!(
                    "pool.operations.{name}: spread_mean_secs must be positive, got {mean}"
                )));
            }
        }
        Ok(())
    }

    /// Overlay environment variables onto the file configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(RAISE_WHEN_NO_IDENTITY_ENV)
            && matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        {
            self.admission = AdmissionMode::FailFast;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_secs > 0).then(|| Duration::from_secs(self.acquire_timeout_secs))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn default_lock(&self) -> Duration {
        Duration::from_secs(self.default_lock_secs)
    }

    /// Lock policy stamped when `operation` is reserved.
    pub fn lock_policy(&self, operation: &Operation) -> LockPolicy {
        match self.operations.get(operation.as_str()) {
            Some(OperationPolicy {
                spread_mean_secs: Some(mean_secs),
                ..
            }) => LockPolicy::Spread {
                mean_secs: *mean_secs,
            },
            Some(OperationPolicy {
                lock_secs: Some(secs),
                ..
            }) => LockPolicy::Fixed(Duration::from_secs(*secs)),
            _ => LockPolicy::Fixed(self.default_lock()),
        }
    }

    pub fn is_pacing(&self, operation: &Operation) -> bool {
        self.operations
            .get(operation.as_str())
            .is_some_and(|policy| policy.pacing)
    }

    /// Builder-style helper for registering a policy in code.
    pub fn with_operation(mut self, name: impl Into<String>, policy: OperationPolicy) -> Self {
        self.operations.insert(name.into(), policy);
        self
    }
}
