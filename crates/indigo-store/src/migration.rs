//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number.  Applied
//! versions are tracked in a `_migrations` table, so running the set twice is
//! a no-op.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    /// May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "credential documents",
        sql: r#"
            CREATE TABLE credentials (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL CHECK(kind IN ('database_password','api_token','tls_keypair','cloud_access_key')),
                state       TEXT NOT NULL CHECK(state IN ('pending','active','rotating','expired','revoked')),
                rotate_at   INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL,
                version     INTEGER NOT NULL CHECK(version >= 1),
                document    TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_credentials_state_rotate ON credentials(state, rotate_at);
        "#,
    },
    Migration {
        version: 2,
        description: "expiry index for due scans",
        sql: r#"
            CREATE INDEX idx_credentials_state_expires ON credentials(state, expires_at);
        "#,
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Apply every migration newer than the database's current version.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "credential schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );
    for migration in pending {
        apply(conn, migration)?;
    }
    info!(new_version = latest_version(), "all migrations applied");
    Ok(())
}

/// Latest applied migration version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

/// Apply one migration inside an immediate transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // `Connection::transaction` needs `&mut`, so manage it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail(format!("failed to begin transaction: {e}")))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail(format!("SQL execution failed: {e}")))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail(format!("failed to record migration: {e}")))
        });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| fail(format!("failed to commit: {e}")))?;
            debug!(version = migration.version, "migration committed");
            Ok(())
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[1].version > window[0].version);
        }
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn due_scan_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='credentials'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert!(indexes.contains(&"idx_credentials_state_rotate".to_string()));
        assert!(indexes.contains(&"idx_credentials_state_expires".to_string()));
    }

    #[test]
    fn state_and_kind_are_constrained() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let insert = |kind: &str, state: &str, version: i64| {
            conn.execute(
                "INSERT INTO credentials (id, kind, state, rotate_at, expires_at, version, document, updated_at) \
                 VALUES (?1, ?2, ?3, 0, 0, ?4, '{}', 0)",
                rusqlite::params![format!("{kind}-{state}-{version}"), kind, state, version],
            )
        };

        assert!(insert("api_token", "active", 1).is_ok());
        assert!(insert("ssh_key", "active", 1).is_err());
        assert!(insert("api_token", "dormant", 1).is_err());
        assert!(insert("api_token", "active", 0).is_err());
    }
}
