pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("shared store connection failed: {0}")]
    Connection(String),
    #[error("shared store command failed: {0}")]
    Command(String),
}

/// The two atomic primitives the rate limiter and circuit breaker need from
/// the shared key-value store. Both must be single round-trip atomic so a
/// horizontally scaled fleet never double-counts.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Add `amount` to the integer at `key`, creating it with `ttl` on first
    /// write. Returns the post-increment value.
    async fn incr_window(&self, key: &str, amount: i64, ttl: Duration) -> StoreResult<i64>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write `value` only if the current raw value equals `expected`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;
}

/// Pick the backend from the configured URL. `memory` is the explicit
/// single-process opt-in; anything else is treated as a redis URL.
pub async fn connect(url: &str) -> StoreResult<Arc<dyn SharedStore>> {
    if url.trim().eq_ignore_ascii_case("memory") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(RedisStore::connect(url).await?))
}
