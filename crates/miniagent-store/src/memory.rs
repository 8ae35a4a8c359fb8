//! In-process session store.
//!
//! Backed by [`DashMap`] so concurrent runs on different keys never contend
//! on a global lock.  Used as the default store and for subagent sessions,
//! which never outlive their delegation.

use async_trait::async_trait;
use dashmap::DashMap;
use miniagent_kernel::Message;
use tracing::debug;

use crate::error::StoreResult;
use crate::store::{SessionStore, validate_key};

/// Volatile [`SessionStore`]; contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Vec<Message>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<Message>> {
        Ok(self
            .sessions
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn put(&self, key: &str, history: &[Message]) -> StoreResult<()> {
        validate_key(key)?;
        self.sessions.insert(key.to_string(), history.to_vec());
        debug!(session_key = key, messages = history.len(), "session stored");
        Ok(())
    }

    /// Keys in ascending order.
    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if self.sessions.remove(key).is_some() {
            debug!(session_key = key, "session deleted");
        }
        Ok(())
    }
}
