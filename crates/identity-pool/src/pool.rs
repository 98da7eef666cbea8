//! Pool manager: leasing, cooldown policy and refresh gating
//!
//! The pool owns no identity state itself. Every decision is delegated to the
//! [`LeaseStore`], which reserves atomically, so several pools (in one process
//! or many) can share a store.
//!
//! Acquire flow:
//! 1. Reserve a random eligible identity, stamping the operation lock
//! 2. On a miss, look up the next unlock time, log it once, sleep, retry
//! 3. On a hit, draw a usage threshold; if the identity crossed it, run the
//!    refresh trigger before handing it out
//! 4. A failed refresh demotes the identity and acquisition starts over

use std::sync::Arc;
use std::time::Duration;

use lease_store::{
    Health, Identity, LeaseStore, NewIdentity, Operation, ReleaseAction, RenewOutcome,
    Reservation, Selector, Stats,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AdmissionMode, LockPolicy, PoolConfig};
use crate::error::{Error, Result};
use crate::import::{self, ImportReport, LineFormat};
use crate::jitter::{self, SharedJitter, ThreadRngJitter};
use crate::metrics;
use crate::refresh::RefreshTrigger;

/// How a lease ended, as judged by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Upstream throttling. `until` is the upstream's reset time (unix ms)
    /// when it supplied one.
    Throttled { until: Option<i64> },
    Banned { reason: String },
    AuthExpired { reason: String },
}

impl Outcome {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Throttled { .. } => "throttled",
            Outcome::Banned { .. } => "banned",
            Outcome::AuthExpired { .. } => "auth_expired",
        }
    }
}

/// Exclusive right to use one identity for one operation.
///
/// Hand it back with [`Pool::release`]. A lease dropped without release
/// frees the identity in a background task and keeps the operation lock.
pub struct Lease {
    reservation: Reservation,
    store: Arc<LeaseStore>,
    released: bool,
}

impl Lease {
    fn new(reservation: Reservation, store: Arc<LeaseStore>) -> Self {
        Self {
            reservation,
            store,
            released: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.reservation.identity
    }

    pub fn handle(&self) -> &str {
        &self.reservation.identity.handle
    }

    pub fn operation(&self) -> &Operation {
        &self.reservation.operation
    }

    pub fn lease_id(&self) -> &str {
        &self.reservation.lease_id
    }

    /// When this identity's lock for the leased operation elapses.
    pub fn locked_until(&self) -> i64 {
        self.reservation.locked_until
    }

    /// Run the store release in a detached task so it completes even if the
    /// awaiting caller is cancelled.
    fn spawn_release(&mut self, action: ReleaseAction) -> JoinHandle<lease_store::Result<bool>> {
        self.released = true;
        let store = Arc::clone(&self.store);
        let handle = self.reservation.identity.handle.clone();
        let lease_id = self.reservation.lease_id.clone();
        let operation = self.reservation.operation.clone();
        tokio::spawn(async move {
            let result = store.release(&handle, &lease_id, &operation, &action).await;
            if let Err(e) = &result {
                error!(identity = %handle, operation = %operation, error = %e, "release failed");
            }
            result
        })
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("handle", &self.handle())
            .field("operation", &self.operation())
            .field("lease_id", &self.lease_id())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            error!(
                identity = %self.handle(),
                "lease dropped outside a runtime; it stays in use until its ttl passes"
            );
            return;
        }
        warn!(
            identity = %self.handle(),
            operation = %self.operation(),
            "lease dropped without release, freeing it and keeping the lock"
        );
        drop(self.spawn_release(ReleaseAction::Keep));
    }
}

/// Summary row for [`Pool::identities_info`].
#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub handle: String,
    pub active: bool,
    pub in_use: bool,
    pub health: &'static str,
    pub group: i64,
    pub total_calls: u64,
    pub calls_since_refresh: u64,
    pub last_used: Option<i64>,
    pub locked_operations: usize,
    pub error_msg: Option<String>,
}

/// Identity pool backed by a shared [`LeaseStore`].
pub struct Pool {
    store: Arc<LeaseStore>,
    config: PoolConfig,
    jitter: SharedJitter,
    trigger: Option<Arc<dyn RefreshTrigger>>,
    refresh_slots: Arc<Semaphore>,
}

impl Pool {
    pub fn new(store: Arc<LeaseStore>, config: PoolConfig) -> Self {
        let refresh_slots = Arc::new(Semaphore::new(config.refresh_concurrency.max(1)));
        info!(
            admission = ?config.admission,
            operations = config.operations.len(),
            "pool initialized"
        );
        Self {
            store,
            config,
            jitter: Arc::new(ThreadRngJitter),
            trigger: None,
            refresh_slots,
        }
    }

    pub fn with_jitter(mut self, jitter: SharedJitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_refresh_trigger(mut self, trigger: Arc<dyn RefreshTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn now_millis(&self) -> i64 {
        self.store.now_millis()
    }

    fn lock_for(&self, operation: &Operation) -> Duration {
        match self.config.lock_policy(operation) {
            LockPolicy::Fixed(duration) => duration,
            LockPolicy::Spread { mean_secs } => jitter::spread(self.jitter.as_ref(), mean_secs),
        }
    }

    /// Lock window for a throttled release without an upstream reset time.
    fn throttle_window(&self, operation: &Operation) -> Duration {
        match self.config.lock_policy(operation) {
            LockPolicy::Spread { mean_secs } => jitter::spread(self.jitter.as_ref(), mean_secs),
            LockPolicy::Fixed(_) => self.config.default_lock(),
        }
    }

    /// Lease an identity for `operation`, waiting for one to free up.
    ///
    /// Under fail-fast admission returns `PoolExhausted` instead of waiting.
    /// With `acquire_timeout_secs` set, gives up with `AcquireTimeout`.
    /// Store contention is retried after a poll interval in both modes and
    /// never surfaced.
    pub async fn acquire(&self, operation: &Operation, selector: &Selector) -> Result<Lease> {
        let started = tokio::time::Instant::now();
        let timeout = self.config.acquire_timeout();
        let mut announced = false;

        loop {
            let contended = match self
                .store
                .reserve(
                    operation,
                    selector,
                    self.lock_for(operation),
                    self.config.lease_ttl(),
                )
                .await
            {
                Ok(Some(reservation)) => {
                    if let Some(lease) = self.admit(reservation).await? {
                        let waited = started.elapsed();
                        if announced {
                            info!(
                                identity = %lease.handle(),
                                operation = %operation,
                                waited_ms = waited.as_millis() as u64,
                                "identity available again, wait over"
                            );
                        }
                        metrics::record_acquire(operation.as_str(), "granted");
                        metrics::record_acquire_wait(operation.as_str(), waited.as_secs_f64());
                        return Ok(lease);
                    }
                    continue;
                }
                Ok(None) => false,
                Err(e) if e.is_busy() => {
                    debug!(operation = %operation, error = %e, "store busy, retrying");
                    true
                }
                Err(e) => return Err(e.into()),
            };

            let next_available_at = if contended {
                None
            } else {
                match self.store.next_available_at(operation, selector).await {
                    Ok(eta) => eta,
                    Err(e) if e.is_busy() => None,
                    Err(e) => return Err(e.into()),
                }
            };

            if self.config.admission == AdmissionMode::FailFast && !contended {
                metrics::record_acquire(operation.as_str(), "exhausted");
                return Err(Error::PoolExhausted {
                    operation: operation.to_string(),
                    next_available_at,
                });
            }

            let waited = started.elapsed();
            if let Some(limit) = timeout
                && waited >= limit
            {
                metrics::record_acquire(operation.as_str(), "timeout");
                return Err(Error::AcquireTimeout {
                    operation: operation.to_string(),
                    waited,
                });
            }

            let now = self.now_millis();
            if !announced && !contended {
                announced = true;
                match next_available_at {
                    Some(at) => info!(
                        operation = %operation,
                        next_available_at = at,
                        wait_secs = (at - now).max(0) / 1000,
                        "no identity available, waiting"
                    ),
                    None => info!(
                        operation = %operation,
                        "no identity available and none locked, waiting"
                    ),
                }
            }

            let mut delay = self.config.poll_interval();
            if let Some(at) = next_available_at {
                delay = delay.min(Duration::from_millis((at - now).max(1) as u64));
            }
            if let Some(limit) = timeout {
                delay = delay.min(limit.saturating_sub(waited));
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Apply the usage threshold to a fresh reservation. `None` means the
    /// identity was demoted and acquisition must start over.
    async fn admit(&self, reservation: Reservation) -> Result<Option<Lease>> {
        let mut lease = Lease::new(reservation, Arc::clone(&self.store));
        if self.trigger.is_none() {
            return Ok(Some(lease));
        }

        let threshold = self.jitter.uniform(
            self.config.refresh_threshold_low,
            self.config.refresh_threshold_high,
        );
        let calls = lease.identity().calls_since_refresh();
        if calls < threshold {
            return Ok(Some(lease));
        }

        info!(
            identity = %lease.handle(),
            calls,
            threshold,
            "usage threshold reached, refreshing"
        );
        match self.refresh(&mut lease).await {
            Ok(()) => Ok(Some(lease)),
            Err(Error::RefreshFailed { handle, reason }) => {
                debug!(identity = %handle, reason = %reason, "refresh failed, acquiring again");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the refresh trigger on a held lease.
    ///
    /// The lease expiry is pushed forward before waiting for a refresh slot
    /// and every half lease ttl while the trigger runs, so the identity stays
    /// in use for the whole refresh. On success the stored credential is
    /// updated and the refresh watermark moves to the current call count. On
    /// failure the identity is demoted, the lease is consumed and
    /// `RefreshFailed` is returned. A lease reclaimed meanwhile also yields
    /// `RefreshFailed`, without demotion.
    pub async fn refresh(&self, lease: &mut Lease) -> Result<()> {
        let trigger = self.trigger.as_ref().ok_or(Error::NoRefreshTrigger)?;
        let ttl = self.config.lease_ttl();
        if !self.extend(lease, ttl).await? {
            return Err(self.lost_during_refresh(lease));
        }
        let _permit = match self.refresh_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let handle = lease.handle().to_string();
                self.finish(lease, ReleaseAction::Keep).await?;
                return Err(Error::RefreshFailed {
                    handle,
                    reason: "refresh slots closed".into(),
                });
            }
        };

        let identity = lease.identity().clone();
        let period = (ttl / 2).max(Duration::from_millis(1));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut running = trigger.refresh(&identity);
        let result = loop {
            tokio::select! {
                result = &mut running => break result,
                _ = heartbeat.tick() => {
                    if !self.extend(lease, ttl).await? {
                        return Err(self.lost_during_refresh(lease));
                    }
                }
            }
        };
        drop(running);

        match result {
            Ok(material) => {
                let Some(updated) = self
                    .store
                    .record_refresh(lease.handle(), lease.lease_id(), material.as_ref())
                    .await?
                else {
                    return Err(self.lost_during_refresh(lease));
                };
                info!(
                    identity = %updated.handle,
                    replaced_credential = material.is_some(),
                    "refresh succeeded"
                );
                metrics::record_refresh("ok");
                lease.reservation.identity = updated;
                Ok(())
            }
            Err(e) => {
                let handle = lease.handle().to_string();
                let reason = format!("refresh failed: {e}");
                warn!(identity = %handle, error = %e, "refresh failed, demoting identity");
                metrics::record_refresh("failed");
                metrics::record_demotion("refresh_failed");
                self.finish(lease, ReleaseAction::Deactivate(reason.clone()))
                    .await?;
                Err(Error::RefreshFailed { handle, reason })
            }
        }
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        Ok(self
            .store
            .extend_lease(lease.handle(), lease.lease_id(), ttl)
            .await?)
    }

    fn lost_during_refresh(&self, lease: &mut Lease) -> Error {
        lease.released = true;
        warn!(identity = %lease.handle(), "lease lost during refresh");
        metrics::record_refresh("lost");
        Error::RefreshFailed {
            handle: lease.handle().to_string(),
            reason: "lease lost during refresh".into(),
        }
    }

    /// Hand a lease back with the caller's verdict.
    ///
    /// Returns whether the lease was still held when released.
    pub async fn release(&self, mut lease: Lease, outcome: Outcome) -> Result<bool> {
        let operation = lease.operation().clone();
        let action = match &outcome {
            Outcome::Success if self.config.is_pacing(&operation) => ReleaseAction::Keep,
            Outcome::Success => ReleaseAction::Unlock,
            Outcome::Throttled { until } => {
                let until = until.unwrap_or_else(|| {
                    self.now_millis() + self.throttle_window(&operation).as_millis() as i64
                });
                info!(
                    identity = %lease.handle(),
                    operation = %operation,
                    locked_until = until,
                    "identity throttled"
                );
                ReleaseAction::LockUntil(until)
            }
            Outcome::Banned { reason } => {
                warn!(identity = %lease.handle(), operation = %operation, reason = %reason, "identity banned");
                metrics::record_demotion("banned");
                ReleaseAction::Deactivate(format!("banned: {reason}"))
            }
            Outcome::AuthExpired { reason } => {
                warn!(identity = %lease.handle(), operation = %operation, reason = %reason, "identity auth expired");
                metrics::record_demotion("auth_expired");
                ReleaseAction::Deactivate(format!("auth expired: {reason}"))
            }
        };
        metrics::record_release(operation.as_str(), outcome.label());
        self.finish(&mut lease, action).await
    }

    async fn finish(&self, lease: &mut Lease, action: ReleaseAction) -> Result<bool> {
        let task = lease.spawn_release(action);
        match task.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(Error::ReleaseTask(e.to_string())),
        }
    }

    /// Keep the same identity for another call of the leased operation.
    ///
    /// Pacing operations wait until the identity's own lock elapses; others
    /// restamp immediately. A lease that was reclaimed or demoted in the
    /// meantime yields `LeaseLost` and is consumed.
    pub async fn renew(&self, lease: &mut Lease) -> Result<()> {
        let operation = lease.operation().clone();
        let pacing = self.config.is_pacing(&operation);
        loop {
            match self
                .store
                .renew(
                    &lease.reservation,
                    self.lock_for(&operation),
                    self.config.lease_ttl(),
                    pacing,
                )
                .await?
            {
                RenewOutcome::Renewed(identity) => {
                    lease.reservation.locked_until =
                        identity.locked_until(&operation).unwrap_or_default();
                    lease.reservation.identity = identity;
                    return Ok(());
                }
                RenewOutcome::Locked { until } => {
                    let wait = (until - self.now_millis()).max(1) as u64;
                    debug!(identity = %lease.handle(), operation = %operation, wait_ms = wait, "waiting for own lock");
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                RenewOutcome::Lost => {
                    lease.released = true;
                    warn!(identity = %lease.handle(), operation = %operation, "lease lost before renewal");
                    return Err(Error::LeaseLost(lease.handle().to_string()));
                }
            }
        }
    }

    /// Add an identity. It starts active iff every configured activation key
    /// is present. Returns `false` when the handle already exists.
    pub async fn add_identity(&self, identity: NewIdentity) -> Result<bool> {
        let active = self.is_activatable(&identity);
        let added = self.store.add_identity(&identity, active).await?;
        if added {
            info!(identity = %identity.handle, active, "identity added");
        } else {
            debug!(identity = %identity.handle, "identity already exists, skipped");
        }
        Ok(added)
    }

    fn is_activatable(&self, identity: &NewIdentity) -> bool {
        self.config
            .activation_keys
            .iter()
            .all(|key| identity.credential.contains(key))
    }

    /// Import identities from delimited lines. Every line is parsed and
    /// validated first; nothing is stored if any line is rejected.
    pub async fn import_lines(&self, text: &str, format: &str) -> Result<ImportReport> {
        let format = LineFormat::parse(format).map_err(|reason| Error::Import { line: 0, reason })?;
        let identities = import::parse_lines(text, &format)
            .map_err(|(line, reason)| Error::Import { line, reason })?;

        let mut report = ImportReport::default();
        for identity in identities {
            let active = self.is_activatable(&identity);
            if self.add_identity(identity).await? {
                report.added += 1;
                if !active {
                    report.inactive += 1;
                }
            } else {
                report.skipped += 1;
            }
        }
        info!(
            added = report.added,
            skipped = report.skipped,
            inactive = report.inactive,
            "identities imported"
        );
        Ok(report)
    }

    /// Take an identity out of rotation immediately, whatever its locks.
    pub async fn deactivate(&self, handle: &str, reason: &str) -> Result<()> {
        if !self.store.set_active(handle, false, Some(reason)).await? {
            return Err(Error::NotFound(handle.to_string()));
        }
        warn!(identity = handle, reason, "identity deactivated");
        metrics::record_demotion("manual");
        Ok(())
    }

    pub async fn reactivate(&self, handle: &str) -> Result<()> {
        if !self.store.set_active(handle, true, None).await? {
            return Err(Error::NotFound(handle.to_string()));
        }
        info!(identity = handle, "identity reactivated");
        Ok(())
    }

    pub async fn delete(&self, handles: &[String]) -> Result<usize> {
        let removed = self.store.delete(handles).await?;
        info!(removed, "identities deleted");
        Ok(removed)
    }

    pub async fn purge_inactive(&self) -> Result<usize> {
        let removed = self.store.purge_inactive().await?;
        info!(removed, "inactive identities purged");
        Ok(removed)
    }

    pub async fn reset_locks(&self) -> Result<usize> {
        Ok(self.store.reset_locks().await?)
    }

    pub async fn stats(&self) -> Result<Stats> {
        Ok(self.store.stats().await?)
    }

    pub async fn next_available_at(
        &self,
        operation: &Operation,
        selector: &Selector,
    ) -> Result<Option<i64>> {
        Ok(self.store.next_available_at(operation, selector).await?)
    }

    /// Per-identity summary, active first, then most recently used.
    pub async fn identities_info(&self) -> Result<Vec<IdentityInfo>> {
        let now = self.now_millis();
        let mut rows: Vec<IdentityInfo> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|identity| IdentityInfo {
                locked_operations: identity.locks.values().filter(|until| **until > now).count(),
                calls_since_refresh: identity.calls_since_refresh(),
                handle: identity.handle,
                active: identity.active,
                in_use: identity.in_use,
                health: identity.health.label(),
                group: identity.group,
                total_calls: identity.total_calls,
                last_used: identity.last_used,
                error_msg: identity.error_msg,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then_with(|| b.last_used.cmp(&a.last_used))
                .then_with(|| a.handle.cmp(&b.handle))
        });
        Ok(rows)
    }

    /// Pool health summary.
    ///
    /// Status mapping: every identity active and unthrottled → healthy, some
    /// available → degraded, none available → unhealthy.
    pub async fn health(&self) -> Result<serde_json::Value> {
        let identities = self.store.list().await?;
        let now = self.now_millis();

        let mut entries = Vec::with_capacity(identities.len());
        let mut available = 0usize;
        let mut throttled = 0usize;
        let mut inactive = 0usize;

        for identity in &identities {
            let throttle_until = identity.locks.values().copied().filter(|until| *until > now).max();
            let status = if !identity.active {
                inactive += 1;
                "inactive"
            } else if identity.health == Health::Throttled && throttle_until.is_some() {
                throttled += 1;
                "throttled"
            } else {
                available += 1;
                "available"
            };

            let mut entry = serde_json::json!({
                "handle": identity.handle,
                "status": status,
                "in_use": identity.in_use,
            });
            if status == "throttled"
                && let Some(until) = throttle_until
            {
                entry["throttled_remaining_secs"] = serde_json::json!((until - now) / 1000);
            }
            if let Some(error) = &identity.error_msg {
                entry["error"] = serde_json::json!(error);
            }
            entries.push(entry);
        }

        let total = identities.len();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(serde_json::json!({
            "status": status,
            "identities_total": total,
            "identities_available": available,
            "identities_throttled": throttled,
            "identities_inactive": inactive,
            "identities": entries,
        }))
    }
}
