//! Application-level configuration loading for the tracker backend.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "SERIES_SCOPE_BACK_CONFIG_PATH";

/// Immutable runtime configuration shared across the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Stats provider endpoint and credentials.
    pub upstream: UpstreamConfig,
    /// Optional fallback proxy used while the circuit breaker is open.
    pub proxy: Option<ProxyConfig>,
    /// Circuit breaker windows and thresholds.
    pub breaker: BreakerConfig,
    /// Upstream call throttle.
    pub limiter: LimiterConfig,
    /// Poll cadence and discovery tuning.
    pub tracker: TrackerConfig,
    /// Debounced persistence tuning.
    pub coalescer: CoalescerConfig,
    /// Websocket feed tuning.
    pub feed: FeedConfig,
    /// Optional chat relay that hosts the live score message.
    pub messenger: Option<MessengerConfig>,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(path = %path.display(), "loaded configuration");
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            proxy: None,
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            tracker: TrackerConfig::default(),
            coalescer: CoalescerConfig::default(),
            feed: FeedConfig::default(),
            messenger: None,
        }
    }
}

/// Stats provider endpoint description.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL all direct call paths are appended to.
    pub base_url: String,
    /// Logical target name used in breaker storage keys and proxy routing.
    pub target: String,
    /// Headers attached to every direct upstream request.
    pub headers: IndexMap<String, String>,
    /// Retry policy for rate-limited direct calls.
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".into(),
            target: "stats".into(),
            headers: IndexMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry policy applied when a direct upstream call answers 429.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Backoff seed used when the response carries no usable `retry-after`.
    pub base_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// Fallback proxy for rerouting calls while the breaker is open.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy base URL.
    pub base_url: String,
    /// How calls are encoded for the proxy.
    pub mode: ProxyMode,
    /// Shared secret sent as `x-proxy-auth`.
    pub auth_token: Option<String>,
}

/// Addressing mode of the fallback proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// The proxy mirrors the upstream URL shape; the original path is
    /// appended to the proxy base URL.
    Rewrite,
    /// The proxy exposes an RPC endpoint taking the method name and
    /// arguments as a JSON body.
    Rpc,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Width of one error-counting window.
    pub window: Duration,
    /// Errors within one window that open the breaker.
    pub threshold: usize,
    /// How long an opened breaker stays in effect.
    pub open_duration: Duration,
    /// Response statuses that count as the upstream struggling.
    pub trip_statuses: Vec<u16>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 5,
            open_duration: Duration::from_secs(300),
            trip_statuses: vec![500, 502, 503, 504],
        }
    }
}

/// Upstream call throttle tuning.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum upstream calls admitted per second.
    pub max_calls_per_second: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_calls_per_second: 5,
        }
    }
}

/// Poll cadence and match discovery tuning.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Interval between poll cycles while the upstream is healthy.
    pub check_interval: Duration,
    /// Escalating poll intervals, in minutes, indexed by consecutive
    /// failed cycles and clamped to the last entry.
    pub backoff_minutes: Vec<u64>,
    /// Minimum spacing between manual refreshes of one session.
    pub refresh_cooldown: Duration,
    /// Fraction of the roster that must report a candidate match before it
    /// is accepted into the series.
    pub discovery_quorum: f64,
    /// Recent-history page size requested per player.
    pub history_page_size: u32,
}

impl TrackerConfig {
    /// Poll delay after `consecutive_errors` failed cycles in a row.
    pub fn backoff_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 || self.backoff_minutes.is_empty() {
            return self.check_interval;
        }
        let index = (consecutive_errors as usize - 1).min(self.backoff_minutes.len() - 1);
        Duration::from_secs(self.backoff_minutes[index] * 60)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(120),
            backoff_minutes: vec![1, 2, 5, 10, 15, 30],
            refresh_cooldown: Duration::from_secs(30),
            discovery_quorum: 0.5,
            history_page_size: 25,
        }
    }
}

/// Debounced KV persistence tuning.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Interval between background flushes of pending writes.
    pub flush_interval: Duration,
    /// Pending write count that forces an immediate flush.
    pub max_pending: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
            max_pending: 64,
        }
    }
}

/// Websocket feed tuning.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Broadcast capacity of each per-session feed hub.
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
        }
    }
}

/// Chat relay that hosts the rendered score message.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Relay base URL.
    pub base_url: String,
    /// Bearer token sent to the relay.
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    upstream: Option<RawUpstream>,
    proxy: Option<RawProxy>,
    breaker: Option<RawBreaker>,
    limiter: Option<RawLimiter>,
    tracker: Option<RawTracker>,
    coalescer: Option<RawCoalescer>,
    feed: Option<RawFeed>,
    messenger: Option<RawMessenger>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        Self {
            upstream: value.upstream.map(Into::into).unwrap_or_default(),
            proxy: value.proxy.map(Into::into),
            breaker: value.breaker.map(Into::into).unwrap_or_default(),
            limiter: value.limiter.map(Into::into).unwrap_or_default(),
            tracker: value.tracker.map(Into::into).unwrap_or_default(),
            coalescer: value.coalescer.map(Into::into).unwrap_or_default(),
            feed: value.feed.map(Into::into).unwrap_or_default(),
            messenger: value.messenger.map(Into::into),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawUpstream {
    base_url: Option<String>,
    target: Option<String>,
    headers: Option<IndexMap<String, String>>,
    retry_max_attempts: Option<u32>,
    retry_base_backoff_ms: Option<u64>,
}

impl From<RawUpstream> for UpstreamConfig {
    fn from(value: RawUpstream) -> Self {
        let defaults = UpstreamConfig::default();
        Self {
            base_url: value.base_url.unwrap_or(defaults.base_url),
            target: value.target.unwrap_or(defaults.target),
            headers: value.headers.unwrap_or_default(),
            retry: RetryConfig {
                max_attempts: value
                    .retry_max_attempts
                    .unwrap_or(defaults.retry.max_attempts)
                    .max(1),
                base_backoff: value
                    .retry_base_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_backoff),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    base_url: String,
    mode: ProxyMode,
    auth_token: Option<String>,
}

impl From<RawProxy> for ProxyConfig {
    fn from(value: RawProxy) -> Self {
        Self {
            base_url: value.base_url,
            mode: value.mode,
            auth_token: value.auth_token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBreaker {
    window_ms: Option<u64>,
    threshold: Option<usize>,
    open_duration_ms: Option<u64>,
    trip_statuses: Option<Vec<u16>>,
}

impl From<RawBreaker> for BreakerConfig {
    fn from(value: RawBreaker) -> Self {
        let defaults = BreakerConfig::default();
        Self {
            window: value
                .window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.window),
            threshold: value.threshold.unwrap_or(defaults.threshold).max(1),
            open_duration: value
                .open_duration_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.open_duration),
            trip_statuses: value.trip_statuses.unwrap_or(defaults.trip_statuses),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLimiter {
    max_calls_per_second: Option<u32>,
}

impl From<RawLimiter> for LimiterConfig {
    fn from(value: RawLimiter) -> Self {
        let defaults = LimiterConfig::default();
        Self {
            max_calls_per_second: value
                .max_calls_per_second
                .unwrap_or(defaults.max_calls_per_second)
                .max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTracker {
    check_interval_secs: Option<u64>,
    backoff_minutes: Option<Vec<u64>>,
    refresh_cooldown_secs: Option<u64>,
    discovery_quorum: Option<f64>,
    history_page_size: Option<u32>,
}

impl From<RawTracker> for TrackerConfig {
    fn from(value: RawTracker) -> Self {
        let defaults = TrackerConfig::default();
        Self {
            check_interval: value
                .check_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.check_interval),
            backoff_minutes: value.backoff_minutes.unwrap_or(defaults.backoff_minutes),
            refresh_cooldown: value
                .refresh_cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_cooldown),
            discovery_quorum: value
                .discovery_quorum
                .unwrap_or(defaults.discovery_quorum)
                .clamp(0.0, 1.0),
            history_page_size: value
                .history_page_size
                .unwrap_or(defaults.history_page_size)
                .max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCoalescer {
    flush_interval_ms: Option<u64>,
    max_pending: Option<usize>,
}

impl From<RawCoalescer> for CoalescerConfig {
    fn from(value: RawCoalescer) -> Self {
        let defaults = CoalescerConfig::default();
        Self {
            flush_interval: value
                .flush_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            max_pending: value.max_pending.unwrap_or(defaults.max_pending).max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFeed {
    channel_capacity: Option<usize>,
}

impl From<RawFeed> for FeedConfig {
    fn from(value: RawFeed) -> Self {
        let defaults = FeedConfig::default();
        Self {
            channel_capacity: value
                .channel_capacity
                .unwrap_or(defaults.channel_capacity)
                .max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessenger {
    base_url: String,
    auth_token: Option<String>,
}

impl From<RawMessenger> for MessengerConfig {
    fn from(value: RawMessenger) -> Self {
        Self {
            base_url: value.base_url,
            auth_token: value.auth_token,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_walks_the_table_and_clamps() {
        let tracker = TrackerConfig::default();
        assert_eq!(tracker.backoff_delay(0), tracker.check_interval);
        assert_eq!(tracker.backoff_delay(1), Duration::from_secs(60));
        assert_eq!(tracker.backoff_delay(2), Duration::from_secs(120));
        assert_eq!(tracker.backoff_delay(6), Duration::from_secs(1800));
        assert_eq!(tracker.backoff_delay(60), Duration::from_secs(1800));
    }

    #[test]
    fn partial_raw_config_falls_back_per_section() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "limiter": { "max_calls_per_second": 2 },
                "proxy": { "base_url": "http://proxy.local", "mode": "rpc" }
            }"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();
        assert_eq!(config.limiter.max_calls_per_second, 2);
        assert_eq!(config.tracker.check_interval, Duration::from_secs(120));
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.mode, ProxyMode::Rpc);
        assert!(config.messenger.is_none());
    }
}
