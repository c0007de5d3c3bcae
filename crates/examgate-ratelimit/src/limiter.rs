//! Distributed fixed-window limiter for one route class.
//!
//! ```text
//! rl:{route_class}:{identity}:{floor(now_ms / window_ms)}
//!        │
//!        └─ INCR + PEXPIRE in one script; count > max ⇒ denied
//! ```
//!
//! Two adjacent windows can together admit up to `2 × max` requests around
//! the boundary. Store failures admit the request.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use examgate_cache::{SharedStore, StoreResult};
use examgate_config::RouteClassConfig;
use metrics::counter;

use crate::counter::WindowCounter;

/// An admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
    /// Counter key, or `None` when the store was unreachable and the request
    /// was admitted without being counted.
    pub counter_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed(Allowance),
    Denied { limit: u64, retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Denied { retry_after, .. } => Some(*retry_after),
            RateDecision::Allowed(_) => None,
        }
    }
}

/// Milliseconds since the Unix epoch. Buckets are derived from wall-clock
/// time so every instance agrees on them.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct DistributedRateLimiter {
    route_class: String,
    config: RouteClassConfig,
    counter: WindowCounter,
}

impl DistributedRateLimiter {
    pub fn new(
        store: SharedStore,
        key_prefix: &str,
        route_class: impl Into<String>,
        config: RouteClassConfig,
    ) -> Self {
        let route_class = route_class.into();
        let counter = WindowCounter::new(
            store,
            format!("{key_prefix}:{route_class}"),
            config.window_ms,
        );
        Self {
            route_class,
            config,
            counter,
        }
    }

    pub fn route_class(&self) -> &str {
        &self.route_class
    }

    pub fn config(&self) -> &RouteClassConfig {
        &self.config
    }

    pub async fn check(&self, identity: &str) -> RateDecision {
        self.check_at(identity, now_ms()).await
    }

    pub async fn check_at(&self, identity: &str, now_ms: u64) -> RateDecision {
        let limit = self.config.max;
        let decision = match self.counter.hit(identity, now_ms).await {
            Ok(hit) if hit.count > limit => {
                tracing::debug!(
                    route_class = %self.route_class,
                    identity = %identity,
                    count = hit.count,
                    "rate limit exceeded"
                );
                RateDecision::Denied {
                    limit,
                    retry_after: hit.reset_after,
                }
            }
            Ok(hit) => RateDecision::Allowed(Allowance {
                limit,
                remaining: limit - hit.count,
                reset_after: hit.reset_after,
                counter_key: Some(hit.key),
            }),
            Err(e) => {
                tracing::warn!(
                    route_class = %self.route_class,
                    error = %e,
                    "rate limit store unavailable, allowing request"
                );
                counter!("examgate_ratelimit_store_errors_total", "route_class" => self.route_class.clone())
                    .increment(1);
                RateDecision::Allowed(Allowance {
                    limit,
                    remaining: limit,
                    reset_after: self.counter.reset_after(now_ms),
                    counter_key: None,
                })
            }
        };

        let outcome = if decision.is_allowed() { "allowed" } else { "denied" };
        counter!(
            "examgate_ratelimit_decisions_total",
            "route_class" => self.route_class.clone(),
            "outcome" => outcome
        )
        .increment(1);
        decision
    }

    /// Give back a counted request (used when only failed requests count).
    pub async fn refund(&self, allowance: &Allowance) {
        let Some(key) = &allowance.counter_key else {
            return;
        };
        if let Err(e) = self.counter.refund(key).await {
            tracing::warn!(route_class = %self.route_class, error = %e, "failed to refund rate limit hit");
        }
    }

    /// Clear the current window for `identity` (operator action).
    pub async fn reset(&self, identity: &str) -> StoreResult<bool> {
        self.counter.reset(identity, now_ms()).await
    }
}
