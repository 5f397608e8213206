use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

/// A serialized frame fanned out to every socket watching one session.
/// Frames are serialized once and shared between subscribers.
pub type FeedFrame = Arc<str>;

/// Broadcast hub wrapper used by the websocket feed services.
pub struct FeedHub {
    sender: broadcast::Sender<FeedFrame>,
}

impl FeedHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent frames.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedFrame> {
        self.sender.subscribe()
    }

    /// Send a frame to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, frame: FeedFrame) {
        let _ = self.sender.send(frame);
    }
}

/// Feed key of one session.
fn feed_key(guild_id: &str, queue_number: u32) -> String {
    format!("{guild_id}:{queue_number}")
}

/// Per-session feed hubs, created lazily when the first socket connects.
pub struct FeedState {
    hubs: DashMap<String, FeedHub>,
    capacity: usize,
}

impl FeedState {
    /// Build the feed registry with a per-hub channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            hubs: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to the feed of one session, creating its hub on first use.
    pub fn subscribe(&self, guild_id: &str, queue_number: u32) -> broadcast::Receiver<FeedFrame> {
        self.hubs
            .entry(feed_key(guild_id, queue_number))
            .or_insert_with(|| FeedHub::new(self.capacity))
            .subscribe()
    }

    /// Fan a frame out to the session's subscribers. Sessions nobody ever
    /// subscribed to have no hub and the frame is dropped.
    pub fn broadcast(&self, guild_id: &str, queue_number: u32, frame: FeedFrame) {
        if let Some(hub) = self.hubs.get(&feed_key(guild_id, queue_number)) {
            hub.broadcast(frame);
        }
    }

    /// Drop the session's hub. Subscribers observe the channel closing.
    pub fn remove(&self, guild_id: &str, queue_number: u32) {
        self.hubs.remove(&feed_key(guild_id, queue_number));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_every_subscriber_of_the_session() {
        let feeds = FeedState::new(8);
        let mut first = feeds.subscribe("guild", 1);
        let mut second = feeds.subscribe("guild", 1);
        let mut other = feeds.subscribe("guild", 2);

        feeds.broadcast("guild", 1, Arc::from("frame"));

        assert_eq!(first.recv().await.unwrap().as_ref(), "frame");
        assert_eq!(second.recv().await.unwrap().as_ref(), "frame");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcasting_without_subscribers_creates_no_hub() {
        let feeds = FeedState::new(8);
        feeds.broadcast("guild", 1, Arc::from("frame"));
        assert!(feeds.hubs.is_empty());
    }

    #[tokio::test]
    async fn removing_the_hub_closes_the_feed() {
        let feeds = FeedState::new(8);
        let mut socket = feeds.subscribe("guild", 1);
        feeds.remove("guild", 1);
        assert!(matches!(
            socket.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
