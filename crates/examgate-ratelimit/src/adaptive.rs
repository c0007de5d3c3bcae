//! Memory-pressure throttle.
//!
//! Below the memory threshold this layer does nothing. Above it, a separate
//! per-client window counter is consulted and clients past a small allowance
//! are turned away as "system overloaded".
//!
//! The memory reading is sampled in the background (see
//! [`AdaptiveLimiter::start_sampler`]); requests only read an atomic.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use examgate_cache::{MemoryProbe, ProcessMemory, SampledMemory, SharedStore};
use examgate_config::AdaptiveConfig;

use crate::counter::WindowCounter;

pub struct AdaptiveLimiter {
    counter: WindowCounter,
    max: u64,
    threshold_bytes: u64,
    memory: Arc<SampledMemory>,
}

impl AdaptiveLimiter {
    pub fn new(store: SharedStore, key_prefix: &str, config: &AdaptiveConfig) -> Self {
        Self::with_probe(store, key_prefix, config, Box::new(ProcessMemory))
    }

    pub fn with_probe(
        store: SharedStore,
        key_prefix: &str,
        config: &AdaptiveConfig,
        probe: Box<dyn MemoryProbe>,
    ) -> Self {
        Self {
            counter: WindowCounter::new(
                store,
                format!("{key_prefix}:adaptive"),
                config.window_ms,
            ),
            max: config.max,
            threshold_bytes: config.memory_threshold_bytes,
            memory: Arc::new(SampledMemory::new(probe)),
        }
    }

    /// Keep the memory reading fresh until `cancel` fires.
    pub fn start_sampler(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tracing::info!(interval_ms = interval.as_millis() as u64, "memory sampler started");
        self.memory.start(interval, cancel)
    }

    pub fn under_pressure(&self) -> bool {
        self.memory
            .resident_bytes()
            .is_some_and(|bytes| bytes > self.threshold_bytes)
    }

    /// `true` when the request must be rejected as overloaded.
    pub async fn should_reject_at(&self, address: &str, now_ms: u64) -> bool {
        if !self.under_pressure() {
            return false;
        }
        match self.counter.hit(address, now_ms).await {
            Ok(hit) if hit.count > self.max => {
                tracing::warn!(address = %address, count = hit.count, "rejecting request under memory pressure");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "adaptive limiter store unavailable, allowing request");
                false
            }
        }
    }
}
