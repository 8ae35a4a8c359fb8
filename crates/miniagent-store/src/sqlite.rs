//! SQLite-backed session store.
//!
//! Each session is a row in `sessions`; its history lives in
//! `session_messages`, one JSON-serialized [`Message`] per row ordered by
//! `position`.  [`SessionStore::put`] rewrites the whole history inside one
//! transaction, so readers observe either the old or the new history, never a
//! mix.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use miniagent_kernel::Message;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;
use crate::store::{SessionStore, validate_key};

/// Durable [`SessionStore`] on top of a migrated [`Database`].
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    /// Wrap an already-migrated database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open (or create) the database file at `path` and migrate it.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        Ok(Self::new(Database::open_and_migrate(path).await?))
    }

    /// Fresh in-memory store, for tests and ephemeral runs.
    pub async fn in_memory() -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Ok(Self::new(db))
    }

    /// Number of messages recorded for `key` (0 for unknown keys).
    #[instrument(skip(self))]
    pub async fn message_count(&self, key: &str) -> StoreResult<u64> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT message_count FROM sessions WHERE key = ?1")?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, i64>(0)?.max(0) as u64),
                    None => Ok(0),
                }
            })
            .await
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Vec<Message>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT payload FROM session_messages \
                     WHERE session_key = ?1 ORDER BY position ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![key], |row| row.get::<_, String>(0))?;
                let mut history = Vec::new();
                for payload in rows {
                    history.push(serde_json::from_str(&payload?)?);
                }
                Ok(history)
            })
            .await
    }

    #[instrument(skip(self, history), fields(messages = history.len()))]
    async fn put(&self, key: &str, history: &[Message]) -> StoreResult<()> {
        validate_key(key)?;
        let key = key.to_string();
        let rows = history
            .iter()
            .map(|m| -> StoreResult<(&'static str, String)> {
                Ok((m.role.as_str(), serde_json::to_string(m)?))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO sessions (key, message_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?3) \
                     ON CONFLICT(key) DO UPDATE SET \
                         message_count = excluded.message_count, \
                         updated_at = excluded.updated_at",
                    rusqlite::params![key, rows.len() as i64, now],
                )?;
                tx.execute(
                    "DELETE FROM session_messages WHERE session_key = ?1",
                    rusqlite::params![key],
                )?;
                {
                    let mut insert = tx.prepare_cached(
                        "INSERT INTO session_messages (session_key, position, role, payload) \
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (position, (role, payload)) in rows.iter().enumerate() {
                        insert.execute(rusqlite::params![key, position as i64, role, payload])?;
                    }
                }
                tx.commit()?;
                debug!(session_key = %key, messages = rows.len(), "session persisted");
                Ok(())
            })
            .await
    }

    /// Most recently updated first, ties broken by key.
    #[instrument(skip(self))]
    async fn list(&self) -> StoreResult<Vec<String>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn
                    .prepare_cached("SELECT key FROM sessions ORDER BY updated_at DESC, key ASC")?;
                let keys = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let removed =
                    conn.execute("DELETE FROM sessions WHERE key = ?1", rusqlite::params![key])?;
                if removed > 0 {
                    debug!(session_key = %key, "session deleted");
                }
                Ok(())
            })
            .await
    }
}
