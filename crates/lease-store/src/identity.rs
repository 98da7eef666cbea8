//! Identity records and the value types used to select and lease them

use std::collections::BTreeMap;
use std::fmt;

use common::Secret;
use serde::Serialize;

use crate::error::{Error, Result};

/// Maximum length of an operation name.
const MAX_OPERATION_LEN: usize = 64;

/// A named class of upstream call with its own cooldown policy.
///
/// Names are restricted to `[A-Za-z0-9_.:-]` because they double as keys in
/// the JSON lock and usage maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Operation(String);

impl Operation {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-');
        if name.is_empty() || name.len() > MAX_OPERATION_LEN || !name.chars().all(valid_char) {
            return Err(Error::InvalidOperation(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON path addressing this operation inside `locks` / `usage`.
    pub(crate) fn json_path(&self) -> String {
        format!("$.\"{}\"", self.0)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential fields (cookies, tokens, headers) for one identity.
///
/// Values are wrapped in [`Secret`]; `Debug` prints keys only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialMaterial(BTreeMap<String, Secret<String>>);

impl CredentialMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Secret::new(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.expose().as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose().as_str()))
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        let plain: BTreeMap<&str, &str> = self.iter().collect();
        serde_json::to_string(&plain)
            .map_err(|e| Error::InvalidIdentity(format!("serializing credential: {e}")))
    }

    pub(crate) fn from_json(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        let plain: BTreeMap<String, String> = serde_json::from_str(raw)?;
        Ok(plain.into_iter().collect())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CredentialMaterial {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut material = Self::new();
        for (k, v) in iter {
            material.insert(k, v);
        }
        material
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

/// Health of an identity, separating temporary throttling from revocation.
///
/// Transitions:
/// - Healthy → Throttled (released with a lock-until)
/// - Throttled → Healthy (released after a successful call, or locks reset)
/// - Healthy/Throttled → Revoked (ban, expired auth, failed refresh)
/// - Revoked → Healthy (successful refresh or explicit reactivation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Throttled,
    Revoked,
}

impl Health {
    pub fn label(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Throttled => "throttled",
            Health::Revoked => "revoked",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "healthy" => Some(Health::Healthy),
            "throttled" => Some(Health::Throttled),
            "revoked" => Some(Health::Revoked),
            _ => None,
        }
    }
}

/// One pooled identity as persisted in the store.
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone)]
pub struct Identity {
    pub handle: String,
    pub credential: CredentialMaterial,
    pub active: bool,
    pub in_use: bool,
    pub lease_id: Option<String>,
    pub lease_expires: Option<i64>,
    /// Operation → unlock timestamp.
    pub locks: BTreeMap<String, i64>,
    /// Operation → number of reservations.
    pub usage: BTreeMap<String, u64>,
    pub total_calls: u64,
    pub refreshed_at_calls: u64,
    pub last_used: Option<i64>,
    pub last_refresh: Option<i64>,
    pub error_msg: Option<String>,
    pub health: Health,
    pub group: i64,
    pub proxy: Option<String>,
    pub added_at: i64,
}

impl Identity {
    /// Unlock timestamp for `operation`, if one is recorded.
    pub fn locked_until(&self, operation: &Operation) -> Option<i64> {
        self.locks.get(operation.as_str()).copied()
    }

    pub fn is_locked_for(&self, operation: &Operation, now: i64) -> bool {
        self.locked_until(operation).is_some_and(|until| until > now)
    }

    /// Reservations made since the last successful refresh.
    pub fn calls_since_refresh(&self) -> u64 {
        self.total_calls.saturating_sub(self.refreshed_at_calls)
    }
}

/// Input for `add_identity`.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub handle: String,
    pub credential: CredentialMaterial,
    pub group: i64,
    pub proxy: Option<String>,
}

impl NewIdentity {
    pub fn new(handle: impl Into<String>, credential: CredentialMaterial) -> Self {
        Self {
            handle: handle.into(),
            credential,
            group: 0,
            proxy: None,
        }
    }

    pub fn with_group(mut self, group: i64) -> Self {
        self.group = group;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Checks applied before an identity is stored.
    pub fn validate(&self) -> Result<()> {
        if self.handle.trim().is_empty() {
            return Err(Error::InvalidIdentity("handle must not be empty".into()));
        }
        if self.handle.chars().any(char::is_whitespace) {
            return Err(Error::InvalidIdentity(format!(
                "handle must not contain whitespace: {:?}",
                self.handle
            )));
        }
        if self.credential.is_empty() {
            return Err(Error::InvalidIdentity(format!(
                "credential material for {} is empty",
                self.handle
            )));
        }
        if let Some(proxy) = &self.proxy
            && !proxy.contains("://")
        {
            return Err(Error::InvalidIdentity(format!(
                "proxy for {} must be a URL, got: {proxy}",
                self.handle
            )));
        }
        Ok(())
    }
}

/// Scope restriction for a reservation. The default selects any identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub handle: Option<String>,
    pub group: Option<i64>,
}

impl Selector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn handle(handle: impl Into<String>) -> Self {
        Self {
            handle: Some(handle.into()),
            group: None,
        }
    }

    pub fn group(group: i64) -> Self {
        Self {
            handle: None,
            group: Some(group),
        }
    }
}

/// A successful reservation: the identity as updated by the reserve statement
/// plus the lease token that later mutations must present.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub identity: Identity,
    pub lease_id: String,
    pub operation: Operation,
    pub locked_until: i64,
}

/// Pool-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    /// Operation → identities whose lock for it has not yet elapsed.
    pub locked_per_operation: BTreeMap<String, u64>,
}
