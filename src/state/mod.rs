pub mod feed;
pub mod lifecycle;
pub mod session;

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{RwLock, watch};

use crate::config::AppConfig;
use crate::dao::kv_store::{KvStore, SharedKv};
use crate::dao::messenger::Messenger;
use crate::dao::write_coalescer::WriteCoalescer;
use crate::services::tracker_actor::TrackerHandle;
use crate::upstream::client::MatchSource;

pub use self::feed::{FeedFrame, FeedState};
pub use self::lifecycle::{InvalidTransition, SessionAction, SessionStatus, next_status};
pub use self::session::TrackerSession;

pub type SharedState = Arc<AppState>;

/// How long a control request waits for the session actor's reply.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Central application state storing the actor registry, feed hubs and
/// handles to the shared collaborators.
pub struct AppState {
    kv: SharedKv,
    writes: Arc<WriteCoalescer>,
    degraded: watch::Sender<bool>,
    config: AppConfig,
    trackers: DashMap<String, TrackerHandle>,
    feeds: FeedState,
    client: Arc<dyn MatchSource>,
    messenger: Arc<dyn Messenger>,
    medals: RwLock<Option<Arc<Value>>>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is
    /// installed into `kv` by the storage supervisor.
    pub fn new(
        config: AppConfig,
        kv: SharedKv,
        writes: Arc<WriteCoalescer>,
        client: Arc<dyn MatchSource>,
        messenger: Arc<dyn Messenger>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let feeds = FeedState::new(config.feed.channel_capacity);
        Arc::new(Self {
            kv,
            writes,
            degraded: degraded_tx,
            config,
            trackers: DashMap::new(),
            feeds,
            client,
            messenger,
            medals: RwLock::new(None),
        })
    }

    /// Obtain a handle to the current key-value store, if one is installed.
    pub async fn kv_store(&self) -> Option<Arc<dyn KvStore>> {
        self.kv.current().await
    }

    /// Debounced write path for session and breaker state.
    pub fn writes(&self) -> &Arc<WriteCoalescer> {
        &self.writes
    }

    /// Install a new key-value backend and leave degraded mode.
    pub async fn install_kv_store(&self, store: Arc<dyn KvStore>) {
        self.kv.install(store).await;
        self.update_degraded(false);
    }

    /// Remove the current key-value backend and enter degraded mode.
    pub async fn clear_kv_store(&self) {
        self.kv.clear().await;
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        self.kv.current().await.is_none()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Registry of live session actors keyed by `guild_id:queue_number`.
    pub fn trackers(&self) -> &DashMap<String, TrackerHandle> {
        &self.trackers
    }

    /// Per-session websocket feed hubs.
    pub fn feeds(&self) -> &FeedState {
        &self.feeds
    }

    /// Stats provider client shared by every session.
    pub fn match_source(&self) -> Arc<dyn MatchSource> {
        Arc::clone(&self.client)
    }

    /// Chat relay hosting the live score messages.
    pub fn messenger(&self) -> Arc<dyn Messenger> {
        Arc::clone(&self.messenger)
    }

    /// Process-wide medal metadata cache, filled on first use.
    pub fn medal_cache(&self) -> &RwLock<Option<Arc<Value>>> {
        &self.medals
    }

    /// Broadcast the degraded flag when the value changes.
    fn update_degraded(&self, value: bool) {
        if *self.degraded.borrow() == value {
            return;
        }

        let _ = self.degraded.send(value);
    }
}
