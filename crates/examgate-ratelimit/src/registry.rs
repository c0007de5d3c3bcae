//! All limiters of a process, built from configuration.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use examgate_cache::SharedStore;
use examgate_config::{ConfigError, RateLimitConfig};

use crate::abuse::AbuseDetector;
use crate::adaptive::AdaptiveLimiter;
use crate::error::RateLimitError;
use crate::limiter::{Allowance, DistributedRateLimiter, RateDecision, now_ms};
use crate::slowdown::SlowDown;

pub struct RateLimiters {
    enabled: bool,
    trust_proxy_headers: bool,
    limiters: HashMap<String, DistributedRateLimiter>,
    slow_down: Option<SlowDown>,
    adaptive: Option<AdaptiveLimiter>,
    abuse: Option<AbuseDetector>,
}

impl RateLimiters {
    pub fn from_config(config: &RateLimitConfig, store: SharedStore) -> Self {
        let limiters = config
            .route_classes
            .iter()
            .map(|(name, class)| {
                let limiter = DistributedRateLimiter::new(
                    store.clone(),
                    &config.key_prefix,
                    name.clone(),
                    class.clone(),
                );
                (name.clone(), limiter)
            })
            .collect();

        let slow_down = config
            .slow_down
            .enabled
            .then(|| SlowDown::new(store.clone(), &config.key_prefix, &config.slow_down));
        let adaptive = config
            .adaptive
            .enabled
            .then(|| AdaptiveLimiter::new(store.clone(), &config.key_prefix, &config.adaptive));
        let abuse = config
            .abuse
            .enabled
            .then(|| AbuseDetector::new(&config.abuse));

        tracing::info!(
            enabled = config.enabled,
            trust_proxy_headers = config.trust_proxy_headers,
            route_classes = config.route_classes.len(),
            slow_down = config.slow_down.enabled,
            adaptive = config.adaptive.enabled,
            abuse = config.abuse.enabled,
            "rate limiters configured"
        );

        Self {
            enabled: config.enabled,
            trust_proxy_headers: config.trust_proxy_headers,
            limiters,
            slow_down,
            adaptive,
            abuse,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn trust_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    pub fn limiter(&self, route_class: &str) -> Option<&DistributedRateLimiter> {
        self.limiters.get(route_class)
    }

    pub fn route_classes(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// Check one request against a route class.
    ///
    /// An unknown route class is a wiring bug; it is logged and the request
    /// admitted.
    pub async fn check_rate_limit(&self, route_class: &str, identity: &str) -> RateDecision {
        if !self.enabled {
            return uncounted();
        }
        match self.limiters.get(route_class) {
            Some(limiter) => limiter.check(identity).await,
            None => {
                tracing::error!(route_class = %route_class, "unknown rate limit route class, allowing request");
                uncounted()
            }
        }
    }

    /// Clear the current window of `identity` in `route_class`.
    pub async fn reset(&self, route_class: &str, identity: &str) -> Result<bool, RateLimitError> {
        let limiter = self
            .limiters
            .get(route_class)
            .ok_or_else(|| ConfigError::MissingRouteClass(route_class.to_string()))?;
        Ok(limiter.reset(identity).await?)
    }

    pub fn slow_down(&self) -> Option<&SlowDown> {
        self.slow_down.as_ref()
    }

    pub fn adaptive(&self) -> Option<&AdaptiveLimiter> {
        self.adaptive.as_ref()
    }

    pub fn abuse(&self) -> Option<&AbuseDetector> {
        self.abuse.as_ref()
    }

    pub(crate) async fn slow_down_delay(&self, address: &str) -> Duration {
        match &self.slow_down {
            Some(slow_down) => slow_down.delay_at(address, now_ms()).await,
            None => Duration::ZERO,
        }
    }

    pub(crate) async fn overloaded(&self, address: &str) -> bool {
        match &self.adaptive {
            Some(adaptive) => adaptive.should_reject_at(address, now_ms()).await,
            None => false,
        }
    }
}

fn uncounted() -> RateDecision {
    RateDecision::Allowed(Allowance {
        limit: 0,
        remaining: 0,
        reset_after: Duration::ZERO,
        counter_key: None,
    })
}

/// Periodically prune idle addresses from the abuse detector.
pub fn start_abuse_pruner(
    limiters: std::sync::Arc<RateLimiters>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(abuse) = limiters.abuse() {
                        let removed = abuse.prune();
                        if removed > 0 {
                            tracing::debug!(removed, "pruned idle abuse tracking entries");
                        }
                    }
                }
            }
        }
    })
}
