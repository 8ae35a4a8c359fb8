//! The key-value session contract.

use async_trait::async_trait;
use miniagent_kernel::Message;

use crate::error::{StoreError, StoreResult};

/// Key-value store of conversation histories.
///
/// Keys are opaque strings.  A session springs into existence on its first
/// [`put`](SessionStore::put) and disappears only on
/// [`delete`](SessionStore::delete); there is no expiry.  The engine
/// guarantees at most one writer per key at a time, so implementations only
/// need per-call atomicity.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Full history for `key`, or an empty list for an unknown key.
    async fn get(&self, key: &str) -> StoreResult<Vec<Message>>;

    /// Replace the history for `key` atomically.  A blank key is rejected
    /// with [`StoreError::InvalidArgument`].
    async fn put(&self, key: &str, history: &[Message]) -> StoreResult<()>;

    /// Every key that currently holds a session.
    async fn list(&self) -> StoreResult<Vec<String>>;

    /// Remove `key`.  Deleting an unknown key is a no-op.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Fails with [`StoreError::InvalidArgument`] on an empty or blank key.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "session key must not be empty".to_string(),
        ));
    }
    Ok(())
}
