//! Schema migrations
//!
//! The applied version lives in `PRAGMA user_version`. Migrations run in
//! order, one transaction each. Every step is idempotent: tables and indexes
//! use `IF NOT EXISTS` and a column that already exists is skipped, so a
//! database whose marker lags behind its actual schema (for example after a
//! crash between the DDL and the version bump) still migrates cleanly.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store;

/// Ordered migrations: (version, statements).
const MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &["CREATE TABLE IF NOT EXISTS identities (
            handle TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
            credential TEXT NOT NULL DEFAULT '{}',
            active INTEGER NOT NULL DEFAULT 0,
            locks TEXT NOT NULL DEFAULT '{}',
            error_msg TEXT DEFAULT NULL,
            proxy TEXT DEFAULT NULL
        )"],
    ),
    (
        2,
        &[
            "ALTER TABLE identities ADD COLUMN usage TEXT NOT NULL DEFAULT '{}'",
            "ALTER TABLE identities ADD COLUMN last_used INTEGER DEFAULT NULL",
        ],
    ),
    (
        3,
        &[
            "ALTER TABLE identities ADD COLUMN in_use INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE identities ADD COLUMN total_calls INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE identities ADD COLUMN group_id INTEGER NOT NULL DEFAULT 0",
        ],
    ),
    (
        4,
        &[
            "ALTER TABLE identities ADD COLUMN lease_id TEXT DEFAULT NULL",
            "ALTER TABLE identities ADD COLUMN lease_expires INTEGER DEFAULT NULL",
            "ALTER TABLE identities ADD COLUMN health TEXT NOT NULL DEFAULT 'healthy'",
        ],
    ),
    (
        5,
        &[
            "ALTER TABLE identities ADD COLUMN refreshed_at_calls INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE identities ADD COLUMN last_refresh INTEGER DEFAULT NULL",
            "ALTER TABLE identities ADD COLUMN added_at INTEGER NOT NULL DEFAULT 0",
            "CREATE INDEX IF NOT EXISTS idx_identities_eligible ON identities(active, in_use)",
        ],
    ),
];

/// Latest schema version known to this build.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

/// Read the persisted schema version.
pub fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Apply every migration newer than the persisted version.
///
/// Returns the version the database ends up at.
pub fn migrate(conn: &mut Connection) -> Result<i64> {
    let current = current_version(conn)?;
    debug!(current, latest = latest_version(), "checking schema version");

    for (version, statements) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        info!(version, "running migration");
        let tx = conn.transaction()?;
        for sql in statements.iter() {
            apply_step(&tx, *version, sql)?;
        }
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    current_version(conn)
}

fn apply_step(conn: &Connection, version: i64, sql: &str) -> Result<()> {
    match conn.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => {
            debug!(version, error = %e, "column already present, skipping");
            Ok(())
        }
        Err(e) if store::is_busy(&e) => Err(e.into()),
        Err(e) => Err(Error::Migration {
            version,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('identities')",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn index_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = 'identities'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        assert_eq!(migrate(&mut conn).unwrap(), latest_version());
        assert_eq!(column_count(&conn), 17);
    }

    #[test]
    fn migrate_twice_is_a_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let columns = column_count(&conn);
        let indexes = index_count(&conn);

        assert_eq!(migrate(&mut conn).unwrap(), latest_version());
        assert_eq!(column_count(&conn), columns);
        assert_eq!(index_count(&conn), indexes);
    }

    #[test]
    fn replaying_every_migration_does_not_error_or_duplicate() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let columns = column_count(&conn);
        let indexes = index_count(&conn);

        // Pretend the version marker was lost: every step runs again.
        conn.pragma_update(None, "user_version", 0).unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), latest_version());
        assert_eq!(column_count(&conn), columns);
        assert_eq!(index_count(&conn), indexes);
    }

    #[test]
    fn partially_applied_migration_completes() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].1[0]).unwrap();
        // Half of v2 landed but the marker still says v1.
        conn.execute_batch("ALTER TABLE identities ADD COLUMN usage TEXT NOT NULL DEFAULT '{}'")
            .unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        assert_eq!(migrate(&mut conn).unwrap(), latest_version());
        assert_eq!(column_count(&conn), 17);
    }

    #[test]
    fn existing_rows_receive_defaults() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].1[0]).unwrap();
        conn.execute(
            "INSERT INTO identities (handle, credential, active) VALUES ('legacy', '{\"ct0\":\"x\"}', 1)",
            [],
        )
        .unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        migrate(&mut conn).unwrap();

        let (in_use, total, health): (i64, i64, String) = conn
            .query_row(
                "SELECT in_use, total_calls, health FROM identities WHERE handle = 'legacy'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(in_use, 0);
        assert_eq!(total, 0);
        assert_eq!(health, "healthy");
    }
}
