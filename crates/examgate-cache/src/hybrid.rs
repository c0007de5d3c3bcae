//! Hybrid cache: tier 1 (in-process DashMap) in front of tier 2 (remote store).
//!
//! ## Lookup Order
//!
//! ```text
//! get(key) → L1 (DashMap) → L2 (remote) → miss
//!               ↓              ↓
//!             hit        hit, promote to L1 with min(remaining TTL, ceiling)
//! ```
//!
//! ## Degradation
//!
//! Remote errors and timeouts never reach callers. Reads treat them as a tier-2
//! miss, writes and deletes still apply to tier 1 and report success.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use examgate_config::CacheConfig;

use crate::error::CacheError;
use crate::local::LocalTier;
use crate::memory_probe::{MemoryProbe, ProcessMemory};
use crate::metrics::{CacheMetrics, MetricsSnapshot, Tier};
use crate::pubsub::InvalidationMessage;
use crate::store::{GlobPattern, RemoteStore, SharedStore, escape_glob};
use crate::ttl::{TtlPolicy, TtlTier};

/// Two-tier read-through cache.
///
/// Cheap to clone; clones share both tiers and the metrics.
#[derive(Clone)]
pub struct HybridCache {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalTier,
    remote: Option<SharedStore>,
    key_prefix: String,
    local_ceiling: Duration,
    invalidation_channel: Option<String>,
    ttl: TtlPolicy,
    metrics: CacheMetrics,
    memory: Box<dyn MemoryProbe>,
}

impl HybridCache {
    /// Cache backed by tier 1 only.
    pub fn new_local(config: &CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Cache with a shared remote tier.
    pub fn new(config: &CacheConfig, remote: SharedStore) -> Self {
        Self::build(config, Some(remote))
    }

    fn build(config: &CacheConfig, remote: Option<SharedStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local: LocalTier::new(config.local_max_entries),
                remote,
                key_prefix: config.key_prefix.clone(),
                local_ceiling: config.local_ceiling(),
                invalidation_channel: config.invalidation_channel.clone(),
                ttl: TtlPolicy::from_config(&config.ttl),
                metrics: CacheMetrics::new(),
                memory: Box::new(ProcessMemory),
            }),
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.inner.ttl
    }

    pub fn local_ceiling(&self) -> Duration {
        self.inner.local_ceiling
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.key_prefix, key)
    }

    fn local_ttl(&self, ttl: Duration) -> Duration {
        ttl.min(self.inner.local_ceiling)
    }

    /// Look a key up in both tiers without touching the hit/miss counters.
    async fn lookup(&self, key: &str) -> Option<(Arc<Vec<u8>>, Tier)> {
        if let Some(data) = self.inner.local.get(key) {
            tracing::debug!(key = %key, "cache hit (L1)");
            return Some((data, Tier::Local));
        }

        let remote = self.inner.remote.as_ref()?;
        match remote.get(&self.remote_key(key)).await {
            Ok(Some(stored)) => {
                tracing::debug!(key = %key, "cache hit (L2)");
                let ttl = self.local_ttl(stored.ttl.unwrap_or(self.inner.local_ceiling));
                let data = Arc::new(stored.data);
                self.inner.local.insert(key, Arc::clone(&data), ttl);
                Some((data, Tier::Remote))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "remote GET failed, serving local-only");
                self.inner.metrics.record_remote_error("get");
                None
            }
        }
    }

    /// Raw bytes for a key, or `None` on a miss in both tiers.
    pub async fn get_raw(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        match self.lookup(key).await {
            Some((data, tier)) => {
                self.inner.metrics.record_hit(tier);
                Some(data)
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                self.inner.metrics.record_miss();
                None
            }
        }
    }

    /// Typed read. An entry that no longer decodes as `T` counts as a miss and
    /// is dropped from both tiers.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some((data, tier)) = self.lookup(key).await else {
            tracing::debug!(key = %key, "cache miss");
            self.inner.metrics.record_miss();
            return None;
        };

        match serde_json::from_slice::<T>(&data) {
            Ok(value) => {
                self.inner.metrics.record_hit(tier);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to decode cached value");
                self.inner.metrics.record_miss();
                self.del(key).await;
                None
            }
        }
    }

    /// Store raw bytes: tier 1 for `min(ttl, ceiling)`, tier 2 for the full TTL.
    ///
    /// Returns whether at least one tier now holds the value. A zero TTL
    /// stores nothing and returns `false`. A tier-2 failure is logged and
    /// swallowed as long as tier 1 took the entry.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        if ttl.is_zero() {
            tracing::debug!(key = %key, "zero TTL, not caching");
            return false;
        }

        let data = Arc::new(value);
        let local = self
            .inner
            .local
            .insert(key, Arc::clone(&data), self.local_ttl(ttl));

        let remote = match &self.inner.remote {
            Some(remote) => match remote.set_ex(&self.remote_key(key), &data, ttl).await {
                Ok(()) => {
                    tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), local, "cache set (L2)");
                    true
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "remote SET failed");
                    self.inner.metrics.record_remote_error("set");
                    false
                }
            },
            None => false,
        };

        if !local && !remote {
            tracing::warn!(key = %key, "value not cached in either tier");
            return false;
        }
        self.inner.metrics.record_set(self.inner.local.len());
        true
    }

    /// Serialize and store a value for `ttl_secs` seconds.
    ///
    /// Serialization failures are the caller's bug and are returned.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<bool, CacheError> {
        let data = serde_json::to_vec(value)?;
        Ok(self
            .set_raw(key, data, Duration::from_secs(ttl_secs))
            .await)
    }

    /// [`set`](Self::set) with the duration of a [`TtlTier`].
    pub async fn set_for<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tier: TtlTier,
    ) -> Result<bool, CacheError> {
        self.set(key, value, self.inner.ttl.seconds(tier)).await
    }

    /// Remove a key from both tiers.
    ///
    /// Tier 2 is cleared first so a concurrent read cannot re-promote the old
    /// value after tier 1 is cleared. Deleting an absent key succeeds.
    pub async fn del(&self, key: &str) -> bool {
        if let Some(remote) = &self.inner.remote
            && let Err(e) = remote.del(&self.remote_key(key)).await
        {
            tracing::warn!(key = %key, error = %e, "remote DEL failed");
            self.inner.metrics.record_remote_error("del");
        }

        let removed = self.inner.local.remove(key);
        self.publish(InvalidationMessage::Key(key.to_string())).await;
        self.inner
            .metrics
            .record_delete(u64::from(removed), self.inner.local.len());
        tracing::debug!(key = %key, "cache invalidated");
        true
    }

    /// Remove every key matching a Redis-style glob from both tiers.
    ///
    /// Returns the number of distinct keys removed. Scans the whole remote
    /// keyspace matching the pattern; meant for coarse, infrequent invalidation.
    pub async fn del_pattern(&self, pattern: &str) -> u64 {
        let glob = match GlobPattern::new(pattern) {
            Ok(glob) => glob,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "invalid invalidation pattern");
                return 0;
            }
        };

        let mut removed: HashSet<String> = HashSet::new();

        if let Some(remote) = &self.inner.remote {
            let remote_pattern = format!("{}{}", escape_glob(&self.inner.key_prefix), pattern);
            match remote.del_pattern(&remote_pattern).await {
                Ok(keys) => {
                    let prefix = self.inner.key_prefix.as_str();
                    removed.extend(
                        keys.into_iter()
                            .filter_map(|k| k.strip_prefix(prefix).map(str::to_string)),
                    );
                }
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "remote pattern delete failed");
                    self.inner.metrics.record_remote_error("del_pattern");
                }
            }
        }

        removed.extend(self.inner.local.remove_matching(&glob));
        self.publish(InvalidationMessage::Pattern(pattern.to_string()))
            .await;

        let count = removed.len() as u64;
        self.inner
            .metrics
            .record_delete(count, self.inner.local.len());
        tracing::debug!(pattern = %pattern, removed = count, "cache pattern invalidated");
        count
    }

    /// Cache-aside read.
    ///
    /// On a miss `compute` runs, its value is stored with `ttl_secs` and
    /// returned. Errors from `compute` are returned untouched and nothing is
    /// cached. Concurrent misses for one key may each compute; the last write
    /// wins.
    pub async fn get_with_fallback<T, E, F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl_secs: u64,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, &value, ttl_secs).await?;
        Ok(value)
    }

    /// Evict tier-1 entries named by an invalidation from another instance.
    pub fn apply_invalidation(&self, message: &InvalidationMessage) -> usize {
        match message {
            InvalidationMessage::Key(key) => usize::from(self.inner.local.remove(key)),
            InvalidationMessage::Pattern(pattern) => match GlobPattern::new(pattern) {
                Ok(glob) => self.inner.local.remove_matching(&glob).len(),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "ignoring invalid pattern");
                    0
                }
            },
        }
    }

    async fn publish(&self, message: InvalidationMessage) {
        let (Some(remote), Some(channel)) =
            (&self.inner.remote, &self.inner.invalidation_channel)
        else {
            return;
        };
        if let Err(e) = remote.publish(channel, &message.encode()).await {
            tracing::warn!(error = %e, "failed to publish cache invalidation");
            self.inner.metrics.record_remote_error("publish");
        }
    }

    /// Snapshot for health/metrics endpoints.
    ///
    /// `approx_memory_bytes` is the process resident size where the platform
    /// reports it, otherwise the bytes held in tier 1.
    pub fn metrics(&self) -> MetricsSnapshot {
        let local = &self.inner.local;
        let memory = self
            .inner
            .memory
            .resident_bytes()
            .unwrap_or_else(|| local.approx_bytes());
        self.inner.metrics.snapshot(local.len(), memory)
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Drop every tier-1 entry. Tier 2 is untouched.
    pub fn clear_local(&self) {
        self.inner.local.clear();
    }

    pub fn local_len(&self) -> usize {
        self.inner.local.len()
    }

    pub fn remote(&self) -> Option<&SharedStore> {
        self.inner.remote.as_ref()
    }

    /// Probe the remote tier (for health checks).
    pub async fn ping_remote(&self) -> Result<(), CacheError> {
        match &self.inner.remote {
            Some(remote) => Ok(remote.ping().await?),
            None => Err(CacheError::Store(crate::error::StoreError::unavailable(
                "no remote tier configured",
            ))),
        }
    }

    pub async fn is_remote_available(&self) -> bool {
        self.ping_remote().await.is_ok()
    }

    /// Start the periodic tier-1 sweep.
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        let token = CancellationToken::new();
        let cache = self.clone();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.inner.local.cleanup_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired local cache entries");
                        }
                    }
                }
            }
        });
        tracing::info!(interval_secs = interval.as_secs(), "local cache sweeper started");
        SweeperHandle { token, task }
    }
}

/// Handle to the background sweep task.
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "local cache sweeper ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::ttl::MAX_TTL;
    use serde::Deserialize;

    fn config() -> CacheConfig {
        CacheConfig::default()
    }

    fn cache_with_store() -> (HybridCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (HybridCache::new(&config(), store.clone()), store)
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct School {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (cache, _) = cache_with_store();
        let school = School {
            id: 42,
            name: "North".into(),
        };
        assert!(cache.set("school:42", &school, 3600).await.unwrap());
        assert_eq!(cache.get::<School>("school:42").await, Some(school));
    }

    #[tokio::test]
    async fn test_remote_uses_prefix() {
        let (cache, store) = cache_with_store();
        cache.set("k", &1u32, 60).await.unwrap();
        assert!(store.get("cache:k").await.unwrap().is_some());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_with_capped_ttl() {
        let (writer, store) = cache_with_store();
        writer.set("k", &"v", 3600).await.unwrap();

        let reader = HybridCache::new(&config(), store);
        assert_eq!(reader.local_len(), 0);
        assert_eq!(reader.get::<String>("k").await.as_deref(), Some("v"));
        assert_eq!(reader.local_len(), 1);
        assert_eq!(reader.metrics().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_entry_never_outlives_ceiling() {
        let (cache, store) = cache_with_store();
        cache.set("k", &"v", 3600).await.unwrap();

        // Remote copy changes behind our back
        store
            .set_ex("cache:k", b"\"new\"", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

        tokio::time::advance(cache.local_ceiling() + Duration::from_millis(1)).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_decode_failure_is_a_miss() {
        let (cache, store) = cache_with_store();
        store
            .set_ex("cache:k", b"not json", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get::<u32>("k").await, None);
        assert_eq!(cache.metrics().misses, 1);
        assert!(store.get("cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_cached() {
        let (cache, store) = cache_with_store();
        assert!(!cache.set("k", &1u32, 0).await.unwrap());
        assert!(store.is_empty());
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test]
    async fn test_del_removes_both_tiers() {
        let (cache, store) = cache_with_store();
        cache.set("k", &1u32, 60).await.unwrap();
        assert!(cache.del("k").await);
        assert_eq!(cache.get::<u32>("k").await, None);
        assert!(store.get("cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_local() {
        let (cache, store) = cache_with_store();
        store.set_available(false);

        assert!(cache.set("k", &7u32, 60).await.unwrap());
        assert_eq!(cache.get::<u32>("k").await, Some(7));
        assert_eq!(cache.get::<u32>("missing").await, None);
        assert!(cache.del("k").await);
        assert_eq!(cache.del_pattern("*").await, 0);
        assert!(!cache.is_remote_available().await);
    }

    #[tokio::test]
    async fn test_del_pattern_counts_union_of_tiers() {
        let (cache, store) = cache_with_store();
        cache.set("a:1", &1u32, 60).await.unwrap();

        // Only in tier 1: written while the remote was down
        store.set_available(false);
        cache.set("a:2", &2u32, 60).await.unwrap();
        store.set_available(true);

        // Only in tier 2: written by another instance
        store
            .set_ex("cache:a:3", b"3", Duration::from_secs(60))
            .await
            .unwrap();
        cache.set("b:1", &1u32, 60).await.unwrap();

        assert_eq!(cache.del_pattern("a:*").await, 3);
        assert_eq!(cache.get::<u32>("b:1").await, Some(1));
    }

    #[tokio::test]
    async fn test_del_pattern_matches_keys_with_newlines() {
        let (cache, store) = cache_with_store();
        cache.set("p:a\nb", &1u32, 60).await.unwrap();
        cache.set("p:c", &2u32, 60).await.unwrap();

        assert_eq!(cache.del_pattern("p:*").await, 2);
        assert_eq!(cache.get::<u32>("p:a\nb").await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped() {
        let (cache, store) = cache_with_store();
        assert!(cache.set("k", &1u32, u64::MAX).await.unwrap());
        assert_eq!(cache.get::<u32>("k").await, Some(1));
        let ttl = store.get("cache:k").await.unwrap().unwrap().ttl.unwrap();
        assert!(ttl <= MAX_TTL);
    }

    #[tokio::test]
    async fn test_set_reports_failure_when_no_tier_stored() {
        let mut cfg = config();
        cfg.local_max_entries = 1;
        let store = Arc::new(MemoryStore::new());
        let cache = HybridCache::new(&cfg, store.clone());
        assert!(cache.set("a", &1u32, 60).await.unwrap());

        // Tier 1 full, tier 2 still takes the write
        assert!(cache.set("b", &2u32, 60).await.unwrap());

        store.set_available(false);
        assert!(!cache.set("c", &3u32, 60).await.unwrap());

        let local_only = HybridCache::new_local(&cfg);
        assert!(local_only.set("a", &1u32, 60).await.unwrap());
        assert!(!local_only.set("b", &2u32, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_with_fallback_computes_once_then_hits() {
        let (cache, _) = cache_with_store();
        let calls = std::sync::atomic::AtomicU32::new(0);

        for _ in 0..3 {
            let value: Result<u32, CacheError> = cache
                .get_with_fallback(
                    "answer",
                    || async {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(42)
                    },
                    60,
                )
                .await;
            assert_eq!(value.unwrap(), 42);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    enum LoadError {
        NotFound,
        Cache,
    }

    impl From<CacheError> for LoadError {
        fn from(_: CacheError) -> Self {
            LoadError::Cache
        }
    }

    #[tokio::test]
    async fn test_get_with_fallback_propagates_compute_error() {
        let (cache, store) = cache_with_store();
        let result: Result<u32, LoadError> = cache
            .get_with_fallback("k", || async { Err(LoadError::NotFound) }, 60)
            .await;
        assert!(matches!(result, Err(LoadError::NotFound)));
        assert!(store.is_empty());
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test]
    async fn test_apply_invalidation_message() {
        let cache = HybridCache::new_local(&config());
        cache.set("test:1", &1u32, 60).await.unwrap();
        cache.set("test:1:questions", &1u32, 60).await.unwrap();
        cache.set("test:2", &1u32, 60).await.unwrap();

        let msg = InvalidationMessage::Pattern("test:1*".into());
        assert_eq!(cache.apply_invalidation(&msg), 2);
        let msg = InvalidationMessage::Key("test:2".into());
        assert_eq!(cache.apply_invalidation(&msg), 1);
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test]
    async fn test_invalidations_are_published() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.invalidation_channel = Some("cache:invalidate".into());
        let cache = HybridCache::new(&cfg, store.clone());
        let mut rx = store.subscribe();

        cache.del("k").await;
        cache.del_pattern("p:*").await;

        let (channel, msg) = rx.recv().await.unwrap();
        assert_eq!(channel, "cache:invalidate");
        assert_eq!(msg, "key:k");
        let (_, msg) = rx.recv().await.unwrap();
        assert_eq!(msg, "pattern:p:*");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = HybridCache::new_local(&config());
        cache.set("k", &1u32, 1).await.unwrap();
        let sweeper = cache.start_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.local_len(), 0);
        sweeper.shutdown().await;
    }
}
