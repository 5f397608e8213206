/// Key-value persistence for sessions and breaker state.
pub mod kv_store;
/// Outbound chat relay hosting the live score message.
pub mod messenger;
/// Storage abstraction layer for database operations.
pub mod storage;
/// Debounced write-behind layer in front of the KV store.
pub mod write_coalescer;
