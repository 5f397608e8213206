//! In-memory KV backend. Default when no CouchDB endpoint is configured;
//! state then lives only as long as the process.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;

use crate::dao::{kv_store::KvStore, storage::StorageResult};

struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local [`KvStore`] with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, StoredEntry>>,
}

impl MemoryKvStore {
    /// New, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: String) -> BoxFuture<'static, StorageResult<Option<Value>>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            let now = Instant::now();
            let expired = match entries.get(&key) {
                Some(entry) if entry.is_expired(now) => true,
                Some(entry) => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
            };
            if expired {
                entries.remove(&key);
            }
            Ok(None)
        })
    }

    fn put(
        &self,
        key: String,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            entries.insert(key, StoredEntry { value, expires_at });
            Ok(())
        })
    }

    fn delete(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            entries.remove(&key);
            Ok(())
        })
    }

    fn keys_with_prefix(&self, prefix: String) -> BoxFuture<'static, StorageResult<Vec<String>>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            let now = Instant::now();
            let mut keys = entries
                .iter()
                .filter(|entry| !entry.value().is_expired(now))
                .map(|entry| entry.key().clone())
                .filter(|key| key.starts_with(&prefix))
                .collect::<Vec<_>>();
            keys.sort();
            Ok(keys)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stores_and_lists_by_prefix() {
        let store = MemoryKvStore::new();
        store
            .put("tracker:g1:1".into(), json!({"a": 1}), None)
            .await
            .unwrap();
        store
            .put("tracker:g1:2".into(), json!({"a": 2}), None)
            .await
            .unwrap();
        store
            .put("breaker:stats:circuit_breaker".into(), json!({}), None)
            .await
            .unwrap();

        let value = store.get("tracker:g1:1".into()).await.unwrap();
        assert_eq!(value, Some(json!({"a": 1})));

        let keys = store.keys_with_prefix("tracker:".into()).await.unwrap();
        assert_eq!(keys, vec!["tracker:g1:1".to_string(), "tracker:g1:2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryKvStore::new();
        store
            .put(
                "breaker:stats:errors:1".into(),
                json!([1]),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert!(store.get("breaker:stats:errors:1".into()).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(store.get("breaker:stats:errors:1".into()).await.unwrap().is_none());
        let keys = store.keys_with_prefix("breaker:".into()).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = MemoryKvStore::new();
        store.put("k".into(), json!(true), None).await.unwrap();
        store.delete("k".into()).await.unwrap();
        assert!(store.get("k".into()).await.unwrap().is_none());
    }
}
