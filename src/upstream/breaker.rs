//! Circuit breaker bookkeeping shared by every session.
//!
//! Failures against the upstream are logged into fixed time-bucketed KV
//! records; crossing the per-window threshold writes a breaker record that
//! reroutes calls through the fallback proxy until it expires. State lives
//! in the KV store, not in process memory, so it survives restarts and is
//! visible to operators.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{TimestampMilliSeconds, serde_as};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{config::BreakerConfig, dao::write_coalescer::WriteCoalescer};

/// Kill switch record; absent or anything but `false` means proxying is
/// allowed.
pub const PROXY_KILL_SWITCH_KEY: &str = "breaker:proxy:enabled";

/// Breaker state key for a target.
pub fn breaker_state_key(target: &str) -> String {
    format!("breaker:{target}:circuit_breaker")
}

/// Error window key for a target and time bucket.
pub fn error_window_key(target: &str, bucket: i64) -> String {
    format!("breaker:{target}:errors:{bucket}")
}

/// An open breaker, persisted while rerouting is in effect.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub activated_at: OffsetDateTime,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub expires_at: OffsetDateTime,
    pub reason: String,
}

impl CircuitBreakerState {
    /// Whether the breaker no longer applies at `now`. Expired records are
    /// ignored even if the TTL has not removed them yet.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// One recorded upstream failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    /// Failure wall-clock time, epoch milliseconds.
    pub at: i64,
    /// Response status that qualified.
    pub status: u16,
    /// URL of the failing call.
    pub url: String,
}

/// Injectable time source.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Shared failure scoreboard deciding when calls leave the direct path.
pub struct BreakerBoard {
    writes: Arc<WriteCoalescer>,
    config: BreakerConfig,
    clock: Clock,
}

impl BreakerBoard {
    /// Board reading the wall clock.
    pub fn new(writes: Arc<WriteCoalescer>, config: BreakerConfig) -> Self {
        Self::with_clock(writes, config, Arc::new(OffsetDateTime::now_utc))
    }

    /// Board with an injected clock so expiry and bucketing are testable.
    pub fn with_clock(writes: Arc<WriteCoalescer>, config: BreakerConfig, clock: Clock) -> Self {
        Self {
            writes,
            config,
            clock,
        }
    }

    /// Whether `status` counts as the upstream struggling.
    pub fn qualifies(&self, status: u16) -> bool {
        self.config.trip_statuses.contains(&status)
    }

    /// Whether calls for `target` should go through the proxy right now.
    pub async fn should_reroute(&self, target: &str) -> bool {
        self.proxy_enabled().await && self.active_breaker(target).await.is_some()
    }

    /// Operator kill switch. Absent means enabled; unreadable state means
    /// disabled, since rerouting decisions cannot be trusted without it.
    pub async fn proxy_enabled(&self) -> bool {
        match self.writes.read_through(PROXY_KILL_SWITCH_KEY).await {
            Ok(Some(value)) => value.as_bool() != Some(false),
            Ok(None) => true,
            Err(error) => {
                debug!(%error, "kill switch unreadable; not rerouting");
                false
            }
        }
    }

    /// The unexpired breaker for `target`, if one is stored.
    pub async fn active_breaker(&self, target: &str) -> Option<CircuitBreakerState> {
        let key = breaker_state_key(target);
        let value = match self.writes.read_through(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(error) => {
                debug!(%target, %error, "breaker state unreadable");
                return None;
            }
        };
        let state: CircuitBreakerState = match serde_json::from_value(value) {
            Ok(state) => state,
            Err(error) => {
                debug!(%target, %error, "discarding undecodable breaker state");
                return None;
            }
        };
        if state.is_expired((self.clock)()) {
            return None;
        }
        Some(state)
    }

    /// Log one qualifying failure. Returns `true` when this failure crossed
    /// the window threshold and opened the breaker.
    pub async fn record_failure(&self, target: &str, status: u16, url: &str) -> bool {
        let now = (self.clock)();
        let now_ms = epoch_ms(now);
        let window_ms = self.config.window.as_millis().max(1) as i64;
        let bucket = now_ms.div_euclid(window_ms);
        let key = error_window_key(target, bucket);

        let mut entries: Vec<WindowEntry> = match self.writes.read_through(&key).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(error) => {
                debug!(%target, %error, "error window unreadable; starting fresh");
                Vec::new()
            }
        };
        entries.push(WindowEntry {
            at: now_ms,
            status,
            url: url.to_string(),
        });
        let count = entries.len();

        match serde_json::to_value(&entries) {
            Ok(value) => {
                // Windows expire on their own once stale.
                self.writes
                    .enqueue(key, value, Some(self.config.window * 2))
                    .await;
            }
            Err(error) => warn!(%target, %error, "failed to serialize error window"),
        }

        if count < self.config.threshold || self.active_breaker(target).await.is_some() {
            return false;
        }

        let state = CircuitBreakerState {
            activated_at: now,
            expires_at: now + self.config.open_duration,
            reason: format!("{count} upstream errors within the window, last {status} at {url}"),
        };
        warn!(
            %target,
            errors = count,
            until = %state.expires_at,
            "opening circuit breaker"
        );
        match serde_json::to_value(&state) {
            Ok(value) => {
                self.writes
                    .enqueue(
                        breaker_state_key(target),
                        value,
                        Some(self.config.open_duration),
                    )
                    .await;
                true
            }
            Err(error) => {
                warn!(%target, %error, "failed to serialize breaker state");
                false
            }
        }
    }
}

/// Epoch milliseconds of an [`OffsetDateTime`].
fn epoch_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::kv_store::{SharedKv, memory::MemoryKvStore};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn test_board(config: BreakerConfig) -> (BreakerBoard, Arc<AtomicI64>, SharedKv) {
        let kv = SharedKv::new();
        let writes = Arc::new(WriteCoalescer::new(kv.clone(), 1_000));
        let now_ms = Arc::new(AtomicI64::new(1_700_000_000_000));
        let clock_ms = now_ms.clone();
        let clock: Clock = Arc::new(move || {
            OffsetDateTime::from_unix_timestamp_nanos(
                i128::from(clock_ms.load(Ordering::SeqCst)) * 1_000_000,
            )
            .unwrap()
        });
        (BreakerBoard::with_clock(writes, config, clock), now_ms, kv)
    }

    async fn install_memory(kv: &SharedKv) {
        kv.install(Arc::new(MemoryKvStore::new())).await;
    }

    #[tokio::test]
    async fn threshold_crossing_opens_the_breaker() {
        let (board, _, kv) = test_board(BreakerConfig::default());
        install_memory(&kv).await;

        for _ in 0..4 {
            assert!(!board.record_failure("stats", 503, "http://up/a").await);
        }
        assert!(board.active_breaker("stats").await.is_none());
        assert!(!board.should_reroute("stats").await);

        assert!(board.record_failure("stats", 502, "http://up/b").await);
        let state = board.active_breaker("stats").await.unwrap();
        assert_eq!(state.expires_at - state.activated_at, Duration::from_secs(300));
        assert!(board.should_reroute("stats").await);

        // Further failures count but do not re-open an open breaker.
        assert!(!board.record_failure("stats", 503, "http://up/c").await);
    }

    #[tokio::test]
    async fn expired_breaker_is_ignored_before_ttl_cleanup() {
        let (board, now_ms, kv) = test_board(BreakerConfig::default());
        install_memory(&kv).await;

        for _ in 0..5 {
            board.record_failure("stats", 500, "http://up").await;
        }
        assert!(board.should_reroute("stats").await);

        now_ms.fetch_add(301_000, Ordering::SeqCst);
        assert!(board.active_breaker("stats").await.is_none());
        assert!(!board.should_reroute("stats").await);
    }

    #[tokio::test]
    async fn failures_in_different_windows_do_not_accumulate() {
        let (board, now_ms, kv) = test_board(BreakerConfig::default());
        install_memory(&kv).await;

        for _ in 0..3 {
            board.record_failure("stats", 500, "http://up").await;
        }
        now_ms.fetch_add(61_000, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(!board.record_failure("stats", 500, "http://up").await);
        }
        assert!(board.active_breaker("stats").await.is_none());
    }

    #[tokio::test]
    async fn kill_switch_blocks_rerouting() {
        let (board, _, kv) = test_board(BreakerConfig::default());
        install_memory(&kv).await;

        for _ in 0..5 {
            board.record_failure("stats", 500, "http://up").await;
        }
        assert!(board.should_reroute("stats").await);

        kv.current()
            .await
            .unwrap()
            .put(
                PROXY_KILL_SWITCH_KEY.into(),
                serde_json::Value::Bool(false),
                None,
            )
            .await
            .unwrap();
        assert!(!board.should_reroute("stats").await);
    }

    #[test]
    fn qualifying_statuses_come_from_config() {
        let kv = SharedKv::new();
        let writes = Arc::new(WriteCoalescer::new(kv, 16));
        let board = BreakerBoard::new(writes, BreakerConfig::default());
        assert!(board.qualifies(502));
        assert!(board.qualifies(503));
        assert!(!board.qualifies(404));
        assert!(!board.qualifies(429));
    }
}
