//! In-process abuse heuristic.
//!
//! Counts requests per address over a short window without touching the
//! remote store. An address that exceeds `max` in one window is flagged and
//! rejected for `block` regardless of route class.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use examgate_cache::ttl::deadline;
use examgate_config::AbuseConfig;

#[derive(Debug, Clone, Copy)]
struct Activity {
    window_start: Instant,
    count: u64,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseVerdict {
    Ok,
    Blocked { retry_after: Duration },
}

pub struct AbuseDetector {
    activity: DashMap<String, Activity>,
    window: Duration,
    max: u64,
    block: Duration,
}

impl AbuseDetector {
    pub fn new(config: &AbuseConfig) -> Self {
        Self {
            activity: DashMap::new(),
            window: Duration::from_millis(config.window_ms),
            max: config.max,
            block: Duration::from_millis(config.block_ms).min(examgate_cache::MAX_TTL),
        }
    }

    /// Record one request from `address` and judge it.
    pub fn check(&self, address: &str) -> AbuseVerdict {
        let now = Instant::now();
        let mut entry = self
            .activity
            .entry(address.to_string())
            .or_insert(Activity {
                window_start: now,
                count: 0,
                blocked_until: None,
            });

        if let Some(until) = entry.blocked_until {
            if now < until {
                return AbuseVerdict::Blocked {
                    retry_after: until - now,
                };
            }
            tracing::info!(address = %address, "abuse block expired");
            entry.blocked_until = None;
            entry.window_start = now;
            entry.count = 0;
        }

        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count > self.max {
            tracing::warn!(
                address = %address,
                count = entry.count,
                block_secs = self.block.as_secs(),
                "client flagged for abusive traffic"
            );
            metrics::counter!("examgate_ratelimit_abuse_flags_total").increment(1);
            entry.blocked_until = deadline(now, self.block);
            return AbuseVerdict::Blocked {
                retry_after: self.block,
            };
        }
        AbuseVerdict::Ok
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        let now = Instant::now();
        self.activity
            .get(address)
            .and_then(|a| a.blocked_until)
            .is_some_and(|until| now < until)
    }

    /// Lift a block (operator action).
    pub fn unblock(&self, address: &str) -> bool {
        self.activity.remove(address).is_some()
    }

    /// Drop idle, unblocked addresses. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.activity.len();
        self.activity.retain(|_, a| match a.blocked_until {
            Some(until) => now < until,
            None => now.duration_since(a.window_start) < self.window,
        });
        before.saturating_sub(self.activity.len())
    }

    pub fn tracked(&self) -> usize {
        self.activity.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AbuseDetector {
        AbuseDetector::new(&AbuseConfig {
            enabled: true,
            window_ms: 1_000,
            max: 3,
            block_ms: 10_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_flags_and_blocks() {
        let d = detector();
        for _ in 0..3 {
            assert_eq!(d.check("a"), AbuseVerdict::Ok);
        }
        assert!(matches!(d.check("a"), AbuseVerdict::Blocked { .. }));
        assert!(d.is_blocked("a"));
        assert_eq!(d.check("b"), AbuseVerdict::Ok);

        tokio::time::advance(Duration::from_secs(5)).await;
        match d.check("a") {
            AbuseVerdict::Blocked { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(5))
            }
            AbuseVerdict::Ok => panic!("still blocked"),
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(d.check("a"), AbuseVerdict::Ok);
    }

    #[tokio::test]
    async fn test_huge_block_does_not_overflow() {
        let d = AbuseDetector::new(&AbuseConfig {
            enabled: true,
            window_ms: 1_000,
            max: 1,
            block_ms: u64::MAX,
        });
        d.check("a");
        assert!(matches!(d.check("a"), AbuseVerdict::Blocked { .. }));
        assert!(d.is_blocked("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_count() {
        let d = detector();
        for _ in 0..3 {
            d.check("a");
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(d.check("a"), AbuseVerdict::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_and_unblock() {
        let d = detector();
        d.check("idle");
        for _ in 0..4 {
            d.check("bad");
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(d.prune(), 1);
        assert_eq!(d.tracked(), 1);
        assert!(d.unblock("bad"));
        assert!(!d.is_blocked("bad"));
    }
}
