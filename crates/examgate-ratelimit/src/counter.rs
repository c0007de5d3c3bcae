//! Fixed-window request counter in the shared remote store.
//!
//! One counter exists per `(prefix, identity, bucket)` where
//! `bucket = floor(now_ms / window_ms)`. Every instance computes the same
//! bucket from wall-clock time, so they all increment the same key.

use std::time::Duration;

use examgate_cache::{RemoteStore, SharedStore, StoreResult};

/// Result of counting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHit {
    /// Requests seen in this window, including this one
    pub count: u64,
    /// Store key of the counter, needed to refund the request later
    pub key: String,
    /// Time until the window closes
    pub reset_after: Duration,
}

/// Parametrized window counter, instantiated once per route class.
#[derive(Clone)]
pub struct WindowCounter {
    store: SharedStore,
    key_prefix: String,
    window_ms: u64,
}

impl WindowCounter {
    /// `key_prefix` is everything before the identity, e.g. `rl:auth`.
    pub fn new(store: SharedStore, key_prefix: impl Into<String>, window_ms: u64) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            window_ms: window_ms.max(1),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn bucket(&self, now_ms: u64) -> u64 {
        now_ms / self.window_ms
    }

    /// Milliseconds until the bucket containing `now_ms` closes (at least 1).
    pub fn reset_after(&self, now_ms: u64) -> Duration {
        let end = (self.bucket(now_ms) + 1) * self.window_ms;
        Duration::from_millis((end - now_ms).max(1))
    }

    pub fn key(&self, identity: &str, bucket: u64) -> String {
        format!("{}:{}:{}", self.key_prefix, identity, bucket)
    }

    /// Count one request for `identity` at `now_ms`.
    ///
    /// The counter expires when its window closes, so it never lives longer
    /// than one window.
    pub async fn hit(&self, identity: &str, now_ms: u64) -> StoreResult<WindowHit> {
        let key = self.key(identity, self.bucket(now_ms));
        let reset_after = self.reset_after(now_ms);
        let count = self.store.incr_window(&key, 1, reset_after).await?;
        Ok(WindowHit {
            count: count.max(0) as u64,
            key,
            reset_after,
        })
    }

    /// Undo a counted request. A counter that already expired is left alone.
    pub async fn refund(&self, key: &str) -> StoreResult<()> {
        self.store.decr_existing(key).await.map(|_| ())
    }

    /// Drop the current window's counter for `identity`.
    pub async fn reset(&self, identity: &str, now_ms: u64) -> StoreResult<bool> {
        self.store
            .del(&self.key(identity, self.bucket(now_ms)))
            .await
    }
}
