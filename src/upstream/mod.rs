/// Circuit breaker bookkeeping shared by every session.
pub mod breaker;
/// Typed accessors over the resilient fetch layer.
pub mod client;
/// Wire types served by the stats provider.
pub mod models;
/// FIFO call throttle with single-retry semantics.
pub mod rate_limit;
/// Breaker-protected HTTP execution with proxy fallback.
pub mod resilient;
