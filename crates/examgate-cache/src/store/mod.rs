//! Remote store abstraction: the shared key-value service behind tier 2 and
//! the rate-limit counters.
//!
//! Implementations must bound every call in time and report failures as
//! [`StoreError`]; callers decide how to degrade.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreResult;

pub mod memory;
pub mod pattern;
pub mod redis;

pub use memory::MemoryStore;
pub use pattern::{GlobPattern, escape_glob};
pub use self::redis::{RedisStore, connect_redis_store};

/// Shared handle to a remote store.
pub type SharedStore = Arc<dyn RemoteStore>;

/// A value read from the remote store with its remaining lifetime, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub data: Vec<u8>,
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Returns whether a key was removed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Deletes every key matching the glob and returns the keys removed.
    async fn del_pattern(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Atomically add `delta` to the counter at `key`, giving a newly created
    /// counter an expiry of `window`. Existing expiries are never extended.
    async fn incr_window(&self, key: &str, delta: i64, window: Duration) -> StoreResult<i64>;

    /// Atomically decrement a positive counter. Returns `None` when the counter
    /// is absent or already zero.
    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}
