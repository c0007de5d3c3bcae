//! Graduated slow-down: past `delay_after` requests in a window, each further
//! request is delayed by one more `delay_step`, up to `max_delay`.

use std::time::Duration;

use examgate_cache::SharedStore;
use examgate_config::SlowDownConfig;

use crate::counter::WindowCounter;

pub struct SlowDown {
    counter: WindowCounter,
    delay_after: u64,
    delay_step: Duration,
    max_delay: Duration,
}

impl SlowDown {
    pub fn new(store: SharedStore, key_prefix: &str, config: &SlowDownConfig) -> Self {
        Self {
            counter: WindowCounter::new(
                store,
                format!("{key_prefix}:slowdown"),
                config.window_ms,
            ),
            delay_after: config.delay_after,
            delay_step: Duration::from_millis(config.delay_step_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay to apply for `count` requests seen in the current window.
    pub fn delay_for_count(&self, count: u64) -> Duration {
        if count <= self.delay_after {
            return Duration::ZERO;
        }
        let over = u32::try_from(count - self.delay_after).unwrap_or(u32::MAX);
        self.delay_step.saturating_mul(over).min(self.max_delay)
    }

    /// Count the request and return how long to hold it. No delay when the
    /// store is unreachable.
    pub async fn delay_at(&self, address: &str, now_ms: u64) -> Duration {
        match self.counter.hit(address, now_ms).await {
            Ok(hit) => self.delay_for_count(hit.count),
            Err(e) => {
                tracing::warn!(error = %e, "slow-down store unavailable, not delaying");
                Duration::ZERO
            }
        }
    }
}
