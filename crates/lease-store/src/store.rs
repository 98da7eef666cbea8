//! SQLite-backed lease store
//!
//! All state lives in the `identities` table. Each public operation is one
//! statement or one short transaction, executed while holding the
//! process-local connection mutex. Reservation is a single
//! `UPDATE … WHERE handle = (SELECT … ORDER BY RANDOM() LIMIT 1) RETURNING …`
//! so two callers can never be handed the same identity, whether they live in
//! this process or another one.

use std::collections::BTreeMap;
use std::time::Duration;

use common::SharedClock;
use rand::RngExt;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::identity::{
    CredentialMaterial, Health, Identity, NewIdentity, Operation, Reservation, Selector, Stats,
};
use crate::schema;

/// Column list shared by every query that materializes an [`Identity`].
const IDENTITY_COLUMNS: &str = "handle, credential, active, in_use, lease_id, lease_expires, \
     locks, usage, total_calls, refreshed_at_calls, last_used, last_refresh, error_msg, \
     health, group_id, proxy, added_at";

/// How a held lease is handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Clear the in-use flag; the operation lock stamped at reservation stays.
    Keep,
    /// Clear the operation lock and the in-use flag.
    Unlock,
    /// Lock the operation until the given timestamp and clear the in-use flag.
    LockUntil(i64),
    /// Deactivate the identity with a reason, regardless of lease ownership.
    Deactivate(String),
}

/// Result of re-stamping a held lease.
#[derive(Debug, Clone)]
pub enum RenewOutcome {
    Renewed(Identity),
    /// Still ours, but the operation lock has not elapsed yet.
    Locked { until: i64 },
    /// Deactivated, deleted, or reclaimed by another lease.
    Lost,
}

/// Bounded retry policy for SQLite busy/locked errors.
#[derive(Debug, Clone)]
struct BusyRetry {
    attempts: u32,
    backoff_min_ms: u64,
    backoff_max_ms: u64,
}

impl BusyRetry {
    fn new(config: &StoreConfig) -> Self {
        Self {
            attempts: config.busy_retries.max(1),
            backoff_min_ms: config.busy_backoff_min_ms,
            backoff_max_ms: config.busy_backoff_max_ms.max(config.busy_backoff_min_ms),
        }
    }

    fn backoff(&self) -> Duration {
        let ms = rand::rng().random_range(self.backoff_min_ms..=self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Blocking variant of [`LeaseStore::with_conn`]'s loop, for setup work
    /// that runs before the store exists.
    fn blocking<T>(&self, what: &'static str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Err(Error::Database(e)) if is_busy(&e) => {
                    if attempt >= self.attempts {
                        warn!(what, attempts = attempt, "store still busy, giving up");
                        return Err(Error::Busy { attempts: attempt });
                    }
                    let delay = self.backoff();
                    debug!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store busy, backing off"
                    );
                    std::thread::sleep(delay);
                }
                result => return result,
            }
        }
    }
}

/// Durable record set of pooled identities.
pub struct LeaseStore {
    conn: Mutex<Connection>,
    clock: SharedClock,
    retry: BusyRetry,
}

impl LeaseStore {
    /// Open (or create) the database file, apply migrations and restrict the
    /// file to its owner.
    ///
    /// Setup waits out another process's write lock with the same bounded
    /// backoff as every other store operation.
    pub fn open(config: &StoreConfig, clock: SharedClock) -> Result<Self> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;
        let mode: String = BusyRetry::new(config).blocking("journal_mode", || {
            Ok(conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?)
        })?;
        debug!(path = %config.path.display(), journal_mode = %mode, "opened identity store");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&config.path, perms)
                .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
        }

        Self::from_connection(conn, config, clock)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory(clock: SharedClock) -> Result<Self> {
        let config = StoreConfig::default();
        Self::from_connection(Connection::open_in_memory()?, &config, clock)
    }

    fn from_connection(
        mut conn: Connection,
        config: &StoreConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let retry = BusyRetry::new(config);
        let version = retry.blocking("migrate", || schema::migrate(&mut conn))?;
        info!(schema_version = version, "identity store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            retry,
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Run `f` against the connection, retrying with randomized backoff while
    /// another process holds the database lock.
    async fn with_conn<T, F>(&self, what: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let mut conn = self.conn.lock().await;
                f(&mut *conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    if attempt >= self.retry.attempts {
                        warn!(what, attempts = attempt, "store still busy, giving up");
                        return Err(Error::Busy { attempts: attempt });
                    }
                    let delay = self.retry.backoff();
                    debug!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store busy, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Atomically pick one eligible identity for `operation`, mark it in use,
    /// stamp its lock to `now + lock_for` and bump its counters.
    ///
    /// Eligible means: active, not in use (or holding a lease that expired),
    /// no unexpired lock for `operation`, and matching `selector`.
    pub async fn reserve(
        &self,
        operation: &Operation,
        selector: &Selector,
        lock_for: Duration,
        lease_ttl: Duration,
    ) -> Result<Option<Reservation>> {
        let path = operation.json_path();
        let sql = format!(
            "UPDATE identities SET
                in_use = 1,
                lease_id = ?1,
                lease_expires = ?2,
                locks = json_set(locks, ?3, ?4),
                usage = json_set(usage, ?3, COALESCE(json_extract(usage, ?3), 0) + 1),
                total_calls = total_calls + 1,
                last_used = ?5
            WHERE handle = (
                SELECT handle FROM identities
                WHERE active = 1
                  AND (in_use = 0 OR lease_expires IS NULL OR lease_expires <= ?5)
                  AND (json_extract(locks, ?3) IS NULL OR json_extract(locks, ?3) <= ?5)
                  AND (?6 IS NULL OR handle = ?6)
                  AND (?7 IS NULL OR group_id = ?7)
                ORDER BY RANDOM()
                LIMIT 1
            )
            RETURNING {IDENTITY_COLUMNS}"
        );

        let identity = self
            .with_conn("reserve", |conn| {
                let now = self.now_millis();
                let lease_id = uuid::Uuid::new_v4().to_string();
                let locked_until = now + lock_for.as_millis() as i64;
                let lease_expires = now + lease_ttl.as_millis() as i64;
                let identity = conn
                    .query_row(
                        &sql,
                        params![
                            lease_id,
                            lease_expires,
                            path,
                            locked_until,
                            now,
                            selector.handle,
                            selector.group
                        ],
                        row_to_identity,
                    )
                    .optional()?;
                Ok(identity.map(|identity| (identity, lease_id, locked_until)))
            })
            .await?;

        Ok(identity.map(|(identity, lease_id, locked_until)| {
            debug!(
                identity = %identity.handle,
                operation = %operation,
                locked_until,
                "identity reserved"
            );
            Reservation {
                identity,
                lease_id,
                operation: operation.clone(),
                locked_until,
            }
        }))
    }

    /// Re-stamp a lease that is still held by `lease_id`.
    ///
    /// With `wait_for_lock`, renewal only succeeds once the identity's own
    /// lock for `operation` has elapsed; otherwise the lock is extended in
    /// place.
    pub async fn renew(
        &self,
        reservation: &Reservation,
        lock_for: Duration,
        lease_ttl: Duration,
        wait_for_lock: bool,
    ) -> Result<RenewOutcome> {
        let path = reservation.operation.json_path();
        let handle = reservation.identity.handle.as_str();
        let lease_id = reservation.lease_id.as_str();
        let sql = format!(
            "UPDATE identities SET
                lease_expires = ?3,
                locks = json_set(locks, ?4, ?5),
                usage = json_set(usage, ?4, COALESCE(json_extract(usage, ?4), 0) + 1),
                total_calls = total_calls + 1,
                last_used = ?6
            WHERE handle = ?1 AND lease_id = ?2 AND in_use = 1 AND active = 1
              AND (?7 = 0 OR json_extract(locks, ?4) IS NULL OR json_extract(locks, ?4) <= ?6)
            RETURNING {IDENTITY_COLUMNS}"
        );

        self.with_conn("renew", |conn| {
            let now = self.now_millis();
            let renewed = conn
                .query_row(
                    &sql,
                    params![
                        handle,
                        lease_id,
                        now + lease_ttl.as_millis() as i64,
                        path,
                        now + lock_for.as_millis() as i64,
                        now,
                        wait_for_lock
                    ],
                    row_to_identity,
                )
                .optional()?;
            if let Some(identity) = renewed {
                return Ok(RenewOutcome::Renewed(identity));
            }

            let state: Option<(bool, bool, Option<String>, Option<i64>)> = conn
                .query_row(
                    "SELECT active, in_use, lease_id, json_extract(locks, ?2)
                     FROM identities WHERE handle = ?1",
                    params![handle, path],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            Ok(match state {
                Some((true, true, Some(current), until)) if current == lease_id => {
                    RenewOutcome::Locked {
                        until: until.unwrap_or(now),
                    }
                }
                _ => RenewOutcome::Lost,
            })
        })
        .await
    }

    /// Hand a lease back. Returns whether the lease was still held.
    ///
    /// `Deactivate` applies even when the lease has been lost; the other
    /// actions only touch the record if `lease_id` still owns it.
    pub async fn release(
        &self,
        handle: &str,
        lease_id: &str,
        operation: &Operation,
        action: &ReleaseAction,
    ) -> Result<bool> {
        let path = operation.json_path();
        let held = self
            .with_conn("release", |conn| {
                let now = self.now_millis();
                let tx = conn.transaction()?;
                let changed = match action {
                    ReleaseAction::Keep => tx.execute(
                        "UPDATE identities SET
                            in_use = 0, lease_id = NULL, lease_expires = NULL, last_used = ?3
                         WHERE handle = ?1 AND lease_id = ?2",
                        params![handle, lease_id, now],
                    )?,
                    ReleaseAction::Unlock => tx.execute(
                        "UPDATE identities SET
                            in_use = 0, lease_id = NULL, lease_expires = NULL,
                            locks = json_remove(locks, ?3),
                            health = CASE WHEN health = 'throttled' THEN 'healthy' ELSE health END,
                            last_used = ?4
                         WHERE handle = ?1 AND lease_id = ?2",
                        params![handle, lease_id, path, now],
                    )?,
                    ReleaseAction::LockUntil(until) => tx.execute(
                        "UPDATE identities SET
                            in_use = 0, lease_id = NULL, lease_expires = NULL,
                            locks = json_set(locks, ?3, ?4),
                            health = CASE WHEN health = 'revoked' THEN health ELSE 'throttled' END,
                            last_used = ?5
                         WHERE handle = ?1 AND lease_id = ?2",
                        params![handle, lease_id, path, until, now],
                    )?,
                    ReleaseAction::Deactivate(reason) => {
                        tx.execute(
                            "UPDATE identities SET active = 0, health = 'revoked', error_msg = ?2
                             WHERE handle = ?1",
                            params![handle, reason],
                        )?;
                        tx.execute(
                            "UPDATE identities SET
                                in_use = 0, lease_id = NULL, lease_expires = NULL, last_used = ?3
                             WHERE handle = ?1 AND lease_id = ?2",
                            params![handle, lease_id, now],
                        )?
                    }
                };
                tx.commit()?;
                Ok(changed > 0)
            })
            .await?;

        if !held {
            warn!(
                identity = handle,
                operation = %operation,
                "released a lease that was no longer held"
            );
        }
        Ok(held)
    }

    /// Clear the lock for `operation` and the in-use flag.
    pub async fn unlock(&self, handle: &str, operation: &Operation) -> Result<bool> {
        let path = operation.json_path();
        let changed = self
            .with_conn("unlock", |conn| {
                conn.execute(
                    "UPDATE identities SET
                        locks = json_remove(locks, ?2),
                        in_use = 0, lease_id = NULL, lease_expires = NULL
                     WHERE handle = ?1",
                    params![handle, path],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Set the lock for `operation` to `until` without touching the lease.
    pub async fn lock_until(&self, handle: &str, operation: &Operation, until: i64) -> Result<bool> {
        let path = operation.json_path();
        let changed = self
            .with_conn("lock_until", |conn| {
                conn.execute(
                    "UPDATE identities SET locks = json_set(locks, ?2, ?3) WHERE handle = ?1",
                    params![handle, path, until],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Activate or deactivate an identity. Deactivation records `reason`;
    /// activation clears any previous error.
    pub async fn set_active(&self, handle: &str, active: bool, reason: Option<&str>) -> Result<bool> {
        let changed = self
            .with_conn("set_active", |conn| {
                if active {
                    conn.execute(
                        "UPDATE identities SET active = 1, health = 'healthy', error_msg = NULL
                         WHERE handle = ?1",
                        params![handle],
                    )
                } else {
                    conn.execute(
                        "UPDATE identities SET active = 0, health = 'revoked', error_msg = ?2
                         WHERE handle = ?1",
                        params![handle, reason],
                    )
                }
            })
            .await?;
        Ok(changed > 0)
    }

    /// Earliest future unlock time for `operation` among active identities
    /// matching `selector`.
    ///
    /// `None` when an eligible identity exists right now, or when nothing is
    /// locked for `operation` at all.
    pub async fn next_available_at(
        &self,
        operation: &Operation,
        selector: &Selector,
    ) -> Result<Option<i64>> {
        let path = operation.json_path();
        self.with_conn("next_available_at", |conn| {
            let now = self.now_millis();
            let eligible_now: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM identities
                    WHERE active = 1
                      AND (in_use = 0 OR lease_expires IS NULL OR lease_expires <= ?2)
                      AND (json_extract(locks, ?1) IS NULL OR json_extract(locks, ?1) <= ?2)
                      AND (?3 IS NULL OR handle = ?3)
                      AND (?4 IS NULL OR group_id = ?4)
                )",
                params![path, now, selector.handle, selector.group],
                |row| row.get(0),
            )?;
            if eligible_now {
                return Ok(None);
            }
            conn.query_row(
                "SELECT MIN(json_extract(locks, ?1)) FROM identities
                 WHERE active = 1
                   AND json_extract(locks, ?1) > ?2
                   AND (?3 IS NULL OR handle = ?3)
                   AND (?4 IS NULL OR group_id = ?4)",
                params![path, now, selector.handle, selector.group],
                |row| row.get(0),
            )
        })
        .await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.with_conn("stats", |conn| {
            let now = self.now_millis();
            let (total, active): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(active), 0) FROM identities",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let mut stmt = conn.prepare(
                "SELECT j.key, SUM(CASE WHEN j.value > ?1 THEN 1 ELSE 0 END)
                 FROM identities, json_each(identities.locks) AS j
                 GROUP BY j.key",
            )?;
            let locked_per_operation = stmt
                .query_map(params![now], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

            Ok(Stats {
                total: total as u64,
                active: active as u64,
                inactive: (total - active) as u64,
                locked_per_operation,
            })
        })
        .await
    }

    /// Insert a new identity. Returns `false` if the handle already exists.
    pub async fn add_identity(&self, new: &NewIdentity, active: bool) -> Result<bool> {
        new.validate()?;
        let credential = new.credential.to_json()?;
        let inserted = self
            .with_conn("add_identity", |conn| {
                conn.execute(
                    "INSERT INTO identities (handle, credential, active, group_id, proxy, added_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(handle) DO NOTHING",
                    params![
                        new.handle,
                        credential,
                        active,
                        new.group,
                        new.proxy,
                        self.now_millis()
                    ],
                )
            })
            .await?;
        Ok(inserted > 0)
    }

    pub async fn get(&self, handle: &str) -> Result<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE handle = ?1");
        self.with_conn("get", |conn| {
            conn.query_row(&sql, params![handle], row_to_identity)
                .optional()
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY handle");
        self.with_conn("list", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_identity)?;
            rows.collect()
        })
        .await
    }

    /// Delete the given handles. Returns how many records were removed.
    pub async fn delete(&self, handles: &[String]) -> Result<usize> {
        self.with_conn("delete", |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for handle in handles {
                removed += tx.execute("DELETE FROM identities WHERE handle = ?1", params![handle])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Remove every inactive identity.
    pub async fn purge_inactive(&self) -> Result<usize> {
        self.with_conn("purge_inactive", |conn| {
            conn.execute("DELETE FROM identities WHERE active = 0", [])
        })
        .await
    }

    /// Drop every operation lock and clear throttled health.
    pub async fn reset_locks(&self) -> Result<usize> {
        self.with_conn("reset_locks", |conn| {
            conn.execute(
                "UPDATE identities SET
                    locks = '{}',
                    health = CASE WHEN health = 'throttled' THEN 'healthy' ELSE health END",
                [],
            )
        })
        .await
    }

    /// Explicit external reset of the usage counters.
    pub async fn reset_counters(&self, handle: &str) -> Result<bool> {
        let changed = self
            .with_conn("reset_counters", |conn| {
                conn.execute(
                    "UPDATE identities SET usage = '{}', total_calls = 0, refreshed_at_calls = 0
                     WHERE handle = ?1",
                    params![handle],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Push a held lease's expiry to `now + lease_ttl` without touching its
    /// locks or counters. `false` means the lease is no longer held.
    pub async fn extend_lease(
        &self,
        handle: &str,
        lease_id: &str,
        lease_ttl: Duration,
    ) -> Result<bool> {
        let expires = self.now_millis() + lease_ttl.as_millis() as i64;
        let changed = self
            .with_conn("extend_lease", |conn| {
                conn.execute(
                    "UPDATE identities SET lease_expires = ?3
                     WHERE handle = ?1 AND lease_id = ?2 AND in_use = 1",
                    params![handle, lease_id, expires],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Record a successful refresh on a held lease: optionally replace the
    /// credential, reactivate, and move the refresh watermark to the current
    /// call count. `None` means the lease is no longer held.
    pub async fn record_refresh(
        &self,
        handle: &str,
        lease_id: &str,
        credential: Option<&CredentialMaterial>,
    ) -> Result<Option<Identity>> {
        let credential = credential.map(CredentialMaterial::to_json).transpose()?;
        let sql = format!(
            "UPDATE identities SET
                credential = COALESCE(?3, credential),
                active = 1, health = 'healthy', error_msg = NULL,
                refreshed_at_calls = total_calls,
                last_refresh = ?4
             WHERE handle = ?1 AND lease_id = ?2 AND in_use = 1
             RETURNING {IDENTITY_COLUMNS}"
        );
        self.with_conn("record_refresh", |conn| {
            conn.query_row(
                &sql,
                params![handle, lease_id, credential, self.now_millis()],
                row_to_identity,
            )
            .optional()
        })
        .await
    }

    pub async fn set_group(&self, handle: &str, group: i64) -> Result<bool> {
        let changed = self
            .with_conn("set_group", |conn| {
                conn.execute(
                    "UPDATE identities SET group_id = ?2 WHERE handle = ?1",
                    params![handle, group],
                )
            })
            .await?;
        Ok(changed > 0)
    }
}

pub(crate) fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let credential: String = row.get(1)?;
    let credential = CredentialMaterial::from_json(&credential)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let health: String = row.get(13)?;
    let health = Health::parse(&health).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            13,
            Type::Text,
            format!("unknown health state: {health}").into(),
        )
    })?;

    Ok(Identity {
        handle: row.get(0)?,
        credential,
        active: row.get(2)?,
        in_use: row.get(3)?,
        lease_id: row.get(4)?,
        lease_expires: row.get(5)?,
        locks: json_column(row, 6)?,
        usage: json_column(row, 7)?,
        total_calls: row.get::<_, i64>(8)? as u64,
        refreshed_at_calls: row.get::<_, i64>(9)? as u64,
        last_used: row.get(10)?,
        last_refresh: row.get(11)?,
        error_msg: row.get(12)?,
        health,
        group: row.get(14)?,
        proxy: row.get(15)?,
        added_at: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use common::TokioClock;

    const LOCK: Duration = Duration::from_secs(60);
    const TTL: Duration = Duration::from_secs(1800);

    fn material() -> CredentialMaterial {
        CredentialMaterial::new()
            .with("auth_token", "token")
            .with("ct0", "csrf")
    }

    fn op(name: &str) -> Operation {
        Operation::new(name).unwrap()
    }

    async fn store_with(handles: &[&str]) -> LeaseStore {
        let store = LeaseStore::open_in_memory(TokioClock::shared()).unwrap();
        for handle in handles {
            let added = store
                .add_identity(&NewIdentity::new(*handle, material()), true)
                .await
                .unwrap();
            assert!(added);
        }
        store
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_marks_in_use_and_stamps_lock() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");

        let r = store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .expect("one identity is eligible");

        assert_eq!(r.identity.handle, "alice");
        assert!(r.identity.in_use);
        assert_eq!(r.identity.lease_id.as_deref(), Some(r.lease_id.as_str()));
        assert_eq!(r.identity.locked_until(&search), Some(r.locked_until));
        assert_eq!(r.locked_until, store.now_millis() + 60_000);
        assert_eq!(r.identity.total_calls, 1);
        assert_eq!(r.identity.usage.get("SearchTimeline"), Some(&1));

        let second = store
            .reserve(&op("UserByScreenName"), &Selector::any(), LOCK, TTL)
            .await
            .unwrap();
        assert!(second.is_none(), "in-use identity must not be reserved twice");
    }

    #[tokio::test(start_paused = true)]
    async fn kept_lock_blocks_only_its_operation_until_elapsed() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let r = store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();
        assert!(
            store
                .release("alice", &r.lease_id, &search, &ReleaseAction::Keep)
                .await
                .unwrap()
        );

        let blocked = store.reserve(&search, &Selector::any(), LOCK, TTL).await.unwrap();
        assert!(blocked.is_none());

        let other = store
            .reserve(&op("UserTweets"), &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .expect("locks are per operation");
        store
            .release("alice", &other.lease_id, &other.operation, &ReleaseAction::Unlock)
            .await
            .unwrap();

        tokio::time::advance(LOCK).await;
        let again = store.reserve(&search, &Selector::any(), LOCK, TTL).await.unwrap();
        assert!(again.is_some(), "lock elapsed, identity eligible again");
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_release_makes_identity_immediately_eligible() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let r = store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();
        store
            .release("alice", &r.lease_id, &search, &ReleaseAction::Unlock)
            .await
            .unwrap();

        let identity = store.get("alice").await.unwrap().unwrap();
        assert!(!identity.in_use);
        assert_eq!(identity.lease_id, None);
        assert_eq!(identity.locked_until(&search), None);
        assert!(
            store
                .reserve(&search, &Selector::any(), LOCK, TTL)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn release_with_foreign_lease_is_ignored() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();

        let held = store
            .release("alice", "not-my-lease", &search, &ReleaseAction::Unlock)
            .await
            .unwrap();
        assert!(!held);
        let identity = store.get("alice").await.unwrap().unwrap();
        assert!(identity.in_use);
        assert!(identity.is_locked_for(&search, store.now_millis()));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_until_release_throttles_and_reports_eta() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let r = store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();
        let until = store.now_millis() + 300_000;
        store
            .release("alice", &r.lease_id, &search, &ReleaseAction::LockUntil(until))
            .await
            .unwrap();

        let identity = store.get("alice").await.unwrap().unwrap();
        assert_eq!(identity.health, Health::Throttled);
        assert_eq!(identity.locked_until(&search), Some(until));
        assert_eq!(
            store.next_available_at(&search, &Selector::any()).await.unwrap(),
            Some(until)
        );
        assert_eq!(
            store
                .next_available_at(&op("UserTweets"), &Selector::any())
                .await
                .unwrap(),
            None,
            "another operation is available right now"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn next_available_at_picks_earliest_lock() {
        let store = store_with(&["alice", "bob"]).await;
        let search = op("SearchTimeline");
        let now = store.now_millis();
        store.lock_until("alice", &search, now + 9_000).await.unwrap();
        store.lock_until("bob", &search, now + 4_000).await.unwrap();

        assert_eq!(
            store.next_available_at(&search, &Selector::any()).await.unwrap(),
            Some(now + 4_000)
        );
        assert_eq!(
            store
                .next_available_at(&search, &Selector::handle("alice"))
                .await
                .unwrap(),
            Some(now + 9_000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_applies_without_lease_and_excludes_identity() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let r = store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();
        store
            .release(
                "alice",
                &r.lease_id,
                &search,
                &ReleaseAction::Deactivate("banned (code 88)".into()),
            )
            .await
            .unwrap();

        let identity = store.get("alice").await.unwrap().unwrap();
        assert!(!identity.active);
        assert!(!identity.in_use);
        assert_eq!(identity.health, Health::Revoked);
        assert_eq!(identity.error_msg.as_deref(), Some("banned (code 88)"));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(
            store
                .reserve(&search, &Selector::any(), LOCK, TTL)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store.next_available_at(&search, &Selector::any()).await.unwrap(),
            None,
            "inactive identities never contribute an ETA"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reclaimed() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let ttl = Duration::from_secs(10);
        let first = store
            .reserve(&search, &Selector::any(), Duration::ZERO, ttl)
            .await
            .unwrap()
            .unwrap();

        assert!(
            store
                .reserve(&search, &Selector::any(), Duration::ZERO, ttl)
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::advance(ttl).await;
        let second = store
            .reserve(&search, &Selector::any(), Duration::ZERO, ttl)
            .await
            .unwrap()
            .expect("expired lease is reclaimable");
        assert_ne!(second.lease_id, first.lease_id);

        let stale = store
            .release("alice", &first.lease_id, &search, &ReleaseAction::Unlock)
            .await
            .unwrap();
        assert!(!stale, "the crashed holder lost its lease");
        assert!(store.get("alice").await.unwrap().unwrap().in_use);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_outcomes() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let r = store
            .reserve(&search, &Selector::any(), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();

        match store.renew(&r, LOCK, TTL, true).await.unwrap() {
            RenewOutcome::Locked { until } => assert_eq!(until, r.locked_until),
            other => panic!("expected Locked, got {other:?}"),
        }

        tokio::time::advance(LOCK).await;
        match store.renew(&r, LOCK, TTL, true).await.unwrap() {
            RenewOutcome::Renewed(identity) => {
                assert_eq!(identity.total_calls, 2);
                assert_eq!(
                    identity.locked_until(&search),
                    Some(store.now_millis() + 60_000)
                );
            }
            other => panic!("expected Renewed, got {other:?}"),
        }

        match store.renew(&r, LOCK, TTL, false).await.unwrap() {
            RenewOutcome::Renewed(identity) => assert_eq!(identity.total_calls, 3),
            other => panic!("expected Renewed, got {other:?}"),
        }

        store
            .release("alice", &r.lease_id, &search, &ReleaseAction::Keep)
            .await
            .unwrap();
        assert!(matches!(
            store.renew(&r, LOCK, TTL, false).await.unwrap(),
            RenewOutcome::Lost
        ));
    }

    #[tokio::test]
    async fn selector_restricts_handle_and_group() {
        let store = store_with(&["alice"]).await;
        store
            .add_identity(&NewIdentity::new("bob", material()).with_group(7), true)
            .await
            .unwrap();
        let search = op("SearchTimeline");

        let by_group = store
            .reserve(&search, &Selector::group(7), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_group.identity.handle, "bob");
        assert_eq!(by_group.identity.group, 7);

        assert!(
            store
                .reserve(&search, &Selector::handle("bob"), LOCK, TTL)
                .await
                .unwrap()
                .is_none()
        );
        let by_handle = store
            .reserve(&search, &Selector::handle("alice"), LOCK, TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_handle.identity.handle, "alice");
    }

    #[tokio::test]
    async fn duplicate_handles_are_not_inserted() {
        let store = store_with(&["alice"]).await;
        let replacement = CredentialMaterial::new().with("ct0", "other");
        assert!(
            !store
                .add_identity(&NewIdentity::new("alice", replacement.clone()), true)
                .await
                .unwrap()
        );
        assert!(
            !store
                .add_identity(&NewIdentity::new("ALICE", replacement), true)
                .await
                .unwrap(),
            "handles compare case-insensitively"
        );
        let identity = store.get("alice").await.unwrap().unwrap();
        assert_eq!(identity.credential.get("ct0"), Some("csrf"));
    }

    #[tokio::test]
    async fn add_identity_rejects_invalid_input() {
        let store = store_with(&[]).await;
        let err = store
            .add_identity(&NewIdentity::new("", material()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_identities_are_never_reserved() {
        let store = store_with(&[]).await;
        store
            .add_identity(&NewIdentity::new("pending", material()), false)
            .await
            .unwrap();
        assert!(
            store
                .reserve(&op("SearchTimeline"), &Selector::any(), LOCK, TTL)
                .await
                .unwrap()
                .is_none()
        );

        store.set_active("pending", true, None).await.unwrap();
        assert!(
            store
                .reserve(&op("SearchTimeline"), &Selector::any(), LOCK, TTL)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_active_and_locked() {
        let store = store_with(&["alice", "bob", "carol"]).await;
        store.set_active("carol", false, Some("expired")).await.unwrap();
        let search = op("SearchTimeline");
        let now = store.now_millis();
        store.lock_until("alice", &search, now + 1_000).await.unwrap();
        store.lock_until("bob", &search, now - 1_000).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.inactive, 1);
        assert_eq!(stats.locked_per_operation.get("SearchTimeline"), Some(&1));
    }

    #[tokio::test]
    async fn record_refresh_moves_watermark_and_reactivates() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        for _ in 0..3 {
            let r = store
                .reserve(&search, &Selector::any(), Duration::ZERO, TTL)
                .await
                .unwrap()
                .unwrap();
            store
                .release("alice", &r.lease_id, &search, &ReleaseAction::Unlock)
                .await
                .unwrap();
        }
        let held = store
            .reserve(&op("UserTweets"), &Selector::any(), Duration::ZERO, TTL)
            .await
            .unwrap()
            .unwrap();
        store.set_active("alice", false, Some("auth expired")).await.unwrap();

        let fresh = CredentialMaterial::new().with("ct0", "rotated");
        let identity = store
            .record_refresh("alice", &held.lease_id, Some(&fresh))
            .await
            .unwrap()
            .unwrap();
        assert!(identity.active);
        assert!(identity.in_use);
        assert_eq!(identity.health, Health::Healthy);
        assert_eq!(identity.error_msg, None);
        assert_eq!(identity.total_calls, 4);
        assert_eq!(identity.calls_since_refresh(), 0);
        assert_eq!(identity.credential.get("ct0"), Some("rotated"));
        assert!(identity.last_refresh.is_some());

        let kept = store
            .record_refresh("alice", &held.lease_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.credential.get("ct0"), Some("rotated"));
        assert!(
            store
                .record_refresh("nobody", &held.lease_id, None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn record_refresh_requires_the_lease() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let first = store
            .reserve(&search, &Selector::any(), Duration::ZERO, TTL)
            .await
            .unwrap()
            .unwrap();
        store
            .release("alice", &first.lease_id, &search, &ReleaseAction::Unlock)
            .await
            .unwrap();
        let second = store
            .reserve(&search, &Selector::any(), Duration::ZERO, TTL)
            .await
            .unwrap()
            .unwrap();

        let fresh = CredentialMaterial::new().with("ct0", "rotated");
        assert!(
            store
                .record_refresh("alice", &first.lease_id, Some(&fresh))
                .await
                .unwrap()
                .is_none()
        );
        let identity = store.get("alice").await.unwrap().unwrap();
        assert_eq!(identity.credential.get("ct0"), Some("csrf"));
        assert_eq!(identity.lease_id.as_deref(), Some(second.lease_id.as_str()));
        assert_eq!(identity.last_refresh, None);
    }

    #[tokio::test(start_paused = true)]
    async fn extended_lease_is_not_reclaimed() {
        let store = store_with(&["alice"]).await;
        let short = Duration::from_secs(5);
        let held = store
            .reserve(&op("SearchTimeline"), &Selector::any(), Duration::ZERO, short)
            .await
            .unwrap()
            .unwrap();

        assert!(
            store
                .extend_lease("alice", &held.lease_id, Duration::from_secs(60))
                .await
                .unwrap()
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(
            store
                .reserve(&op("UserTweets"), &Selector::any(), Duration::ZERO, short)
                .await
                .unwrap()
                .is_none()
        );

        store
            .release("alice", &held.lease_id, &op("SearchTimeline"), &ReleaseAction::Keep)
            .await
            .unwrap();
        assert!(
            !store
                .extend_lease("alice", &held.lease_id, Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn administrative_maintenance() {
        let store = store_with(&["alice", "bob", "carol"]).await;
        let search = op("SearchTimeline");
        let now = store.now_millis();
        store.lock_until("alice", &search, now + 60_000).await.unwrap();
        store.set_active("bob", false, Some("banned")).await.unwrap();

        assert_eq!(store.reset_locks().await.unwrap(), 3);
        assert!(
            store
                .get("alice")
                .await
                .unwrap()
                .unwrap()
                .locks
                .is_empty()
        );

        assert!(store.set_group("carol", 3).await.unwrap());
        assert_eq!(store.get("carol").await.unwrap().unwrap().group, 3);

        assert_eq!(store.purge_inactive().await.unwrap(), 1);
        assert!(store.get("bob").await.unwrap().is_none());

        let removed = store
            .delete(&["carol".to_string(), "nobody".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let handles: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.handle)
            .collect();
        assert_eq!(handles, vec!["alice"]);
    }

    #[tokio::test]
    async fn reset_counters_zeroes_usage() {
        let store = store_with(&["alice"]).await;
        let search = op("SearchTimeline");
        let r = store
            .reserve(&search, &Selector::any(), Duration::ZERO, TTL)
            .await
            .unwrap()
            .unwrap();
        store
            .release("alice", &r.lease_id, &search, &ReleaseAction::Unlock)
            .await
            .unwrap();

        assert!(store.reset_counters("alice").await.unwrap());
        let identity = store.get("alice").await.unwrap().unwrap();
        assert_eq!(identity.total_calls, 0);
        assert_eq!(identity.refreshed_at_calls, 0);
        assert!(identity.usage.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_share_an_identity() {
        let handles: Vec<String> = (0..20).map(|i| format!("user{i}")).collect();
        let refs: Vec<&str> = handles.iter().map(String::as_str).collect();
        let store = Arc::new(store_with(&refs).await);

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .reserve(&op("SearchTimeline"), &Selector::any(), LOCK, TTL)
                    .await
                    .unwrap()
                    .map(|r| r.identity.handle)
            }));
        }

        let mut reserved = Vec::new();
        for task in tasks {
            if let Some(handle) = task.await.unwrap() {
                reserved.push(handle);
            }
        }
        let unique: HashSet<_> = reserved.iter().collect();
        assert_eq!(reserved.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_sharing_a_file_never_share_an_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            busy_retries: 200,
            busy_backoff_min_ms: 1,
            busy_backoff_max_ms: 10,
            ..StoreConfig::at(dir.path().join("identities.db"))
        };

        let first = Arc::new(LeaseStore::open(&config, TokioClock::shared()).unwrap());
        for i in 0..10 {
            first
                .add_identity(&NewIdentity::new(format!("user{i}"), material()), true)
                .await
                .unwrap();
        }
        let second = Arc::new(LeaseStore::open(&config, TokioClock::shared()).unwrap());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = if i % 2 == 0 {
                Arc::clone(&first)
            } else {
                Arc::clone(&second)
            };
            tasks.push(tokio::spawn(async move {
                store
                    .reserve(&op("SearchTimeline"), &Selector::any(), LOCK, TTL)
                    .await
                    .unwrap()
                    .map(|r| r.identity.handle)
            }));
        }

        let mut reserved = Vec::new();
        for task in tasks {
            if let Some(handle) = task.await.unwrap() {
                reserved.push(handle);
            }
        }
        let unique: HashSet<_> = reserved.iter().collect();
        assert_eq!(reserved.len(), 10);
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test]
    async fn open_waits_out_another_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.db");
        let writer = Connection::open(&path).unwrap();
        writer
            .execute_batch("BEGIN IMMEDIATE; CREATE TABLE other_app (x INTEGER);")
            .unwrap();
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            writer.execute_batch("COMMIT").unwrap();
        });

        let config = StoreConfig {
            busy_backoff_min_ms: 100,
            busy_backoff_max_ms: 200,
            ..StoreConfig::at(&path)
        };
        let opened = LeaseStore::open(&config, TokioClock::shared());
        holder.join().unwrap();

        let store = match opened {
            Ok(store) => store,
            Err(e) => panic!("open failed while another writer held the file: {e}"),
        };
        store
            .add_identity(&NewIdentity::new("alice", material()), true)
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn store_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::at(dir.path().join("identities.db"));
        let _store = LeaseStore::open(&config, TokioClock::shared()).unwrap();

        let mode = std::fs::metadata(&config.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
