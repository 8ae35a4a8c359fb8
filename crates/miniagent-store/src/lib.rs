//! # miniagent-store
//!
//! Session storage for miniagent.
//!
//! A session is an ordered message history addressed by an opaque string
//! key.  The [`SessionStore`] trait is the only contract the agent engine
//! depends on; two backends ship with the crate:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  SessionStore (get / put / list / delete) │
//! ├────────────────────┬─────────────────────┤
//! │ MemorySessionStore │ SqliteSessionStore  │
//! │ (DashMap)          │ (sessions +         │
//! │                    │  session_messages)  │
//! ├────────────────────┴─────────────────────┤
//! │            Database (rusqlite WAL)        │
//! │       Migrations (versioned, transact.)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use miniagent_store::{SessionStore, SqliteSessionStore};
//!
//! let store = SqliteSessionStore::open("data/sessions.db").await?;
//! store.put("agent:main:default", &history).await?;
//! let history = store.get("agent:main:default").await?;
//! ```

pub mod db;
pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod store;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use store::SessionStore;
