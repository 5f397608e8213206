//! Key-value persistence for tracker sessions and circuit breaker bookkeeping.
//!
//! All durable state lives in one flat keyspace:
//!
//! - `tracker:<guild_id>:<queue_number>`: serialized session
//! - `breaker:<target>:circuit_breaker`: active breaker, if any
//! - `breaker:<target>:errors:<bucket>`: per-window error log
//! - `breaker:proxy:enabled`: proxy kill switch (absent means enabled)

#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::dao::storage::{StorageError, StorageResult};

/// Abstraction over the key-value persistence layer.
///
/// Values are stored as raw JSON; the optional `ttl` lets short-lived
/// records (breaker windows) expire without a sweeper.
pub trait KvStore: Send + Sync {
    fn get(&self, key: String) -> BoxFuture<'static, StorageResult<Option<Value>>>;
    fn put(
        &self,
        key: String,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn delete(&self, key: String) -> BoxFuture<'static, StorageResult<()>>;
    fn keys_with_prefix(&self, prefix: String) -> BoxFuture<'static, StorageResult<Vec<String>>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Cloneable slot holding the currently installed [`KvStore`].
///
/// The slot starts empty; the storage supervisor installs a backend once it
/// connects and clears it again if the backend is lost.
#[derive(Clone, Default)]
pub struct SharedKv {
    inner: Arc<RwLock<Option<Arc<dyn KvStore>>>>,
}

impl SharedKv {
    /// New, empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the installed backend, if any.
    pub async fn current(&self) -> Option<Arc<dyn KvStore>> {
        let guard = self.inner.read().await;
        guard.as_ref().cloned()
    }

    /// Replace the installed backend.
    pub async fn install(&self, store: Arc<dyn KvStore>) {
        let mut guard = self.inner.write().await;
        *guard = Some(store);
    }

    /// Drop the installed backend, returning whether one was present.
    pub async fn clear(&self) -> bool {
        let mut guard = self.inner.write().await;
        guard.take().is_some()
    }
}

/// Decode a stored JSON value into a typed record.
pub fn decode_value<T: DeserializeOwned>(key: &str, value: Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|err| StorageError::corrupt(key, err))
}
