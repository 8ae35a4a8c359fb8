//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch with a version number.  Applied
//! versions are recorded in `_migrations`, so [`run_all`] only ever applies
//! what is missing and is safe to call on every open.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    /// Strictly increasing, starting at 1.
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new migrations to the end; never edit an applied one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "sessions and ordered session_messages",
        sql: r#"
            CREATE TABLE sessions (
                key           TEXT PRIMARY KEY,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );

            CREATE TABLE session_messages (
                session_key TEXT NOT NULL REFERENCES sessions(key) ON DELETE CASCADE,
                position    INTEGER NOT NULL,
                role        TEXT NOT NULL CHECK(role IN ('user','assistant','tool')),
                payload     TEXT NOT NULL,
                PRIMARY KEY (session_key, position)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "recency index for session listing",
        sql: r#"
            CREATE INDEX idx_sessions_updated ON sessions(updated_at DESC);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Apply every pending migration.  Synchronous; run it on the blocking pool.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!(current_version = current, "session schema is up to date");
        return Ok(());
    }

    info!(current_version = current, pending = pending.len(), "running pending migrations");
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Latest applied version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })
}

/// Version the schema ends up at after [`run_all`].
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
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

/// Apply one migration inside `BEGIN IMMEDIATE` / `COMMIT`.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let fail = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{stage}: {e}"),
    };

    info!(version = migration.version, description = migration.description, "applying migration");
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail("failed to begin transaction", e))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail("SQL execution failed", e))
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
            .map_err(|e| fail("failed to record migration", e))
        });

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT;")
            .map_err(|e| fail("failed to commit", e)),
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

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn versions_strictly_increase() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[1].version > pair[0].version);
        }
    }

    #[test]
    fn fresh_database_reaches_latest_version() {
        let conn = conn();
        assert_eq!(current_version(&conn).unwrap_or(0), 0);
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 2);
        assert_eq!(latest_version(), 2);
    }

    #[test]
    fn rerunning_is_a_no_op() {
        let conn = conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        let applied: i64 = conn
            .query_row("SELECT count(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn role_check_constraint_rejects_unknown_roles() {
        let conn = conn();
        run_all(&conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (key, created_at, updated_at) VALUES ('k', 0, 0)",
            [],
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO session_messages (session_key, position, role, payload) \
             VALUES ('k', 0, 'system', '{}')",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn deleting_session_cascades_to_messages() {
        let conn = conn();
        run_all(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO sessions (key, created_at, updated_at) VALUES ('k', 0, 0);
             INSERT INTO session_messages (session_key, position, role, payload)
                 VALUES ('k', 0, 'user', '{}');
             DELETE FROM sessions WHERE key = 'k';",
        )
        .unwrap();
        let left: i64 = conn
            .query_row("SELECT count(*) FROM session_messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
