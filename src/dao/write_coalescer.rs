//! Debounced KV persistence.
//!
//! Poll bookkeeping and breaker windows change far more often than they need
//! to hit the database. Writes are collected per key with the newest value
//! winning; a background task flushes them on an interval, and crossing the
//! pending-size threshold forces an early flush.

use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::{
    config::CoalescerConfig,
    dao::{kv_store::SharedKv, storage::StorageResult},
};

struct PendingWrite {
    value: Value,
    ttl: Option<Duration>,
}

/// Per-key write debouncer in front of the shared KV slot.
pub struct WriteCoalescer {
    kv: SharedKv,
    pending: Mutex<IndexMap<String, PendingWrite>>,
    max_pending: usize,
}

impl WriteCoalescer {
    /// Coalescer without a background flusher; callers flush explicitly.
    pub fn new(kv: SharedKv, max_pending: usize) -> Self {
        Self {
            kv,
            pending: Mutex::new(IndexMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    /// Coalescer plus a background task flushing on `config.flush_interval`.
    pub fn spawn(kv: SharedKv, config: &CoalescerConfig) -> Arc<Self> {
        let coalescer = Arc::new(Self::new(kv, config.max_pending));
        let flusher = coalescer.clone();
        let flush_interval = config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                flusher.flush_now().await;
            }
        });
        coalescer
    }

    /// Record `value` as the newest state of `key`.
    pub async fn enqueue(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let overflow = {
            let mut pending = self.pending.lock().await;
            pending.insert(key.into(), PendingWrite { value, ttl });
            pending.len() >= self.max_pending
        };
        if overflow {
            self.flush_now().await;
        }
    }

    /// Read `key`, preferring a pending write over the stored value so
    /// read-modify-write callers always see their own latest state.
    pub async fn read_through(&self, key: &str) -> StorageResult<Option<Value>> {
        {
            let pending = self.pending.lock().await;
            if let Some(write) = pending.get(key) {
                return Ok(Some(write.value.clone()));
            }
        }
        match self.kv.current().await {
            Some(store) => store.get(key.to_string()).await,
            None => Ok(None),
        }
    }

    /// Write all pending entries through to the store. Entries that fail, or
    /// everything when no store is installed, stay pending for the next
    /// flush unless a newer write replaced them meanwhile.
    pub async fn flush_now(&self) -> usize {
        let drained: Vec<(String, PendingWrite)> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }

        let Some(store) = self.kv.current().await else {
            debug!(
                count = drained.len(),
                "storage not installed; keeping writes pending"
            );
            self.requeue(drained).await;
            return 0;
        };

        let mut flushed = 0;
        let mut failed = Vec::new();
        for (key, write) in drained {
            match store
                .put(key.clone(), write.value.clone(), write.ttl)
                .await
            {
                Ok(()) => flushed += 1,
                Err(error) => {
                    warn!(%key, %error, "failed to flush pending write");
                    failed.push((key, write));
                }
            }
        }
        if !failed.is_empty() {
            self.requeue(failed).await;
        }
        flushed
    }

    /// Number of writes waiting for the next flush.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn requeue(&self, entries: Vec<(String, PendingWrite)>) {
        let mut pending = self.pending.lock().await;
        for (key, write) in entries {
            pending.entry(key).or_insert(write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::kv_store::memory::MemoryKvStore;
    use serde_json::json;

    fn coalescer_with_store(max_pending: usize) -> (WriteCoalescer, SharedKv) {
        let kv = SharedKv::new();
        (WriteCoalescer::new(kv.clone(), max_pending), kv)
    }

    #[tokio::test]
    async fn read_through_sees_pending_writes_before_flush() {
        let (coalescer, kv) = coalescer_with_store(16);
        kv.install(Arc::new(MemoryKvStore::new())).await;

        coalescer.enqueue("tracker:g:1", json!({"v": 1}), None).await;
        coalescer.enqueue("tracker:g:1", json!({"v": 2}), None).await;

        let seen = coalescer.read_through("tracker:g:1").await.unwrap();
        assert_eq!(seen, Some(json!({"v": 2})));

        let stored = kv
            .current()
            .await
            .unwrap()
            .get("tracker:g:1".into())
            .await
            .unwrap();
        assert_eq!(stored, None);
    }

    #[tokio::test]
    async fn flush_writes_newest_value_and_clears_pending() {
        let (coalescer, kv) = coalescer_with_store(16);
        kv.install(Arc::new(MemoryKvStore::new())).await;

        coalescer.enqueue("k", json!(1), None).await;
        coalescer.enqueue("k", json!(2), None).await;
        let flushed = coalescer.flush_now().await;

        assert_eq!(flushed, 1);
        assert_eq!(coalescer.pending_len().await, 0);
        let stored = kv.current().await.unwrap().get("k".into()).await.unwrap();
        assert_eq!(stored, Some(json!(2)));
    }

    #[tokio::test]
    async fn crossing_the_threshold_forces_a_flush() {
        let (coalescer, kv) = coalescer_with_store(2);
        kv.install(Arc::new(MemoryKvStore::new())).await;

        coalescer.enqueue("a", json!(1), None).await;
        assert_eq!(coalescer.pending_len().await, 1);
        coalescer.enqueue("b", json!(2), None).await;

        assert_eq!(coalescer.pending_len().await, 0);
        let store = kv.current().await.unwrap();
        assert_eq!(store.get("a".into()).await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("b".into()).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn writes_stay_pending_while_no_store_is_installed() {
        let (coalescer, kv) = coalescer_with_store(16);

        coalescer.enqueue("k", json!(1), None).await;
        assert_eq!(coalescer.flush_now().await, 0);
        assert_eq!(coalescer.pending_len().await, 1);

        kv.install(Arc::new(MemoryKvStore::new())).await;
        assert_eq!(coalescer.flush_now().await, 1);
        let stored = kv.current().await.unwrap().get("k".into()).await.unwrap();
        assert_eq!(stored, Some(json!(1)));
    }
}
