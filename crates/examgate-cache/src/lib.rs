//! Two-tier caching for the examgate backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                HybridCache                 │
//! │  L1: DashMap (per instance, short-lived)   │
//! │  L2: RemoteStore (shared, full TTL)        │
//! └────────────────────────────────────────────┘
//!           │ del / del_pattern
//!           ▼
//!   PUBLISH cache:invalidate ──► other instances evict L1
//! ```
//!
//! The same [`RemoteStore`] also carries the rate-limit window counters
//! (`examgate-ratelimit`), under a separate key prefix.

pub mod error;
pub mod hybrid;
pub mod invalidation;
pub mod local;
pub mod memory_probe;
pub mod metrics;
pub mod pubsub;
pub mod store;
pub mod ttl;

use std::sync::Arc;

pub use error::{CacheError, StoreError, StoreResult};
pub use hybrid::{HybridCache, SweeperHandle};
pub use invalidation::{CacheKeys, EntityRef, Invalidator};
pub use memory_probe::{MemoryProbe, ProcessMemory, SampledMemory};
pub use metrics::MetricsSnapshot;
pub use pubsub::{CacheInvalidationListener, InvalidationMessage};
pub use store::{MemoryStore, RedisStore, RemoteStore, SharedStore, StoredValue};
pub use ttl::{MAX_TTL, TtlPolicy, TtlTier};

use examgate_config::RedisConfig;

/// Connect the shared remote store described by `config`.
///
/// An unreachable server is not an error here; see [`store::connect_redis_store`].
pub async fn connect_remote_store(config: &RedisConfig) -> StoreResult<SharedStore> {
    let store = store::connect_redis_store(config).await?;
    Ok(Arc::new(store))
}
