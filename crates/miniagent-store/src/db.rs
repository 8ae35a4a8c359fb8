//! SQLite connection handle.
//!
//! [`Database`] owns a single `rusqlite::Connection` behind `Arc<Mutex<_>>`.
//! Every query runs on tokio's blocking pool via [`Database::execute`] or
//! [`Database::execute_mut`], so async callers never block a worker thread.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Cloneable, thread-safe handle to one SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file at `path` and apply pragmas.
    ///
    /// Blocking; prefer [`Database::open_and_migrate`] from async code.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening session database");
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory session database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open `path` on the blocking pool and bring the schema up to date.
    pub async fn open_and_migrate(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Apply every pending schema migration.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            f(&guard)
        })
        .await?
    }

    /// Run `f` with mutable access, for `conn.transaction()`.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await?
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        apply_pragmas(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))
}

// ── pragmas ──────────────────────────────────────────────────────────

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    // WAL lets readers proceed while a session is being rewritten.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    // session_messages rows cascade from sessions.
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    debug!("session database pragmas applied");
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
