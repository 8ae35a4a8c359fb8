//! Integration tests for the session store backends.

use std::sync::Arc;

use miniagent_kernel::{Message, resolve_session_key};
use miniagent_store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoreError};

// ═══════════════════════════════════════════════════════════════════════
//  Shared contract
// ═══════════════════════════════════════════════════════════════════════

async fn exercise_contract(store: Arc<dyn SessionStore>) {
    let key = resolve_session_key(None, Some("contract"));
    assert!(store.get(&key).await.unwrap().is_empty());

    let history = vec![Message::user("hello"), Message::assistant("hi there")];
    store.put(&key, &history).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), history);
    assert_eq!(store.list().await.unwrap(), vec![key.clone()]);

    let err = store.put("", &history).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
    assert_eq!(store.list().await.unwrap(), vec![key.clone()]);

    store.delete(&key).await.unwrap();
    store.delete(&key).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_empty());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_store_honours_contract() {
    exercise_contract(Arc::new(MemorySessionStore::new())).await;
}

#[tokio::test]
async fn sqlite_store_honours_contract() {
    exercise_contract(Arc::new(SqliteSessionStore::in_memory().await.unwrap())).await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Durability
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sqlite_sessions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");

    {
        let store = SqliteSessionStore::open(path.clone()).await.unwrap();
        store
            .put("agent:main:a", &[Message::user("remember me")])
            .await
            .unwrap();
        store
            .put("agent:main:b", &[Message::user("and me")])
            .await
            .unwrap();
    }

    let reopened = SqliteSessionStore::open(path).await.unwrap();
    let mut keys = reopened.list().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["agent:main:a", "agent:main:b"]);
    let history = reopened.get("agent:main:a").await.unwrap();
    assert_eq!(history[0].text(), "remember me");
}

#[tokio::test]
async fn concurrent_writers_on_distinct_keys_do_not_clobber() {
    let store = Arc::new(SqliteSessionStore::in_memory().await.unwrap());
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let key = format!("agent:main:s{i}");
            let history: Vec<Message> = (0..=i).map(|n| Message::user(n.to_string())).collect();
            store.put(&key, &history).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for i in 0..8 {
        let history = store.get(&format!("agent:main:s{i}")).await.unwrap();
        assert_eq!(history.len(), i + 1);
    }
}
