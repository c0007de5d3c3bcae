//! TTL tiers shared by every cache caller.

use examgate_config::TtlTiersConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Longest lifetime given to any cache entry or counter (100 years).
/// Larger TTLs are accepted and clamped.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Expiry instant `ttl` after `now`, clamped to [`MAX_TTL`].
///
/// `None` when the clock cannot represent the instant; callers treat that as
/// no expiry.
pub fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl.min(MAX_TTL))
}

/// Whole milliseconds for a store-side expiry, within `1..=MAX_TTL`.
pub fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlTier {
    Short,
    Medium,
    Long,
    VeryLong,
}

impl TtlTier {
    pub const ALL: [TtlTier; 4] = [
        TtlTier::Short,
        TtlTier::Medium,
        TtlTier::Long,
        TtlTier::VeryLong,
    ];
}

/// Value table mapping each [`TtlTier`] to its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    short: u64,
    medium: u64,
    long: u64,
    very_long: u64,
}

impl TtlPolicy {
    pub fn from_config(config: &TtlTiersConfig) -> Self {
        Self {
            short: config.short,
            medium: config.medium,
            long: config.long,
            very_long: config.very_long,
        }
    }

    pub fn seconds(&self, tier: TtlTier) -> u64 {
        match tier {
            TtlTier::Short => self.short,
            TtlTier::Medium => self.medium,
            TtlTier::Long => self.long,
            TtlTier::VeryLong => self.very_long,
        }
    }

    pub fn duration(&self, tier: TtlTier) -> Duration {
        Duration::from_secs(self.seconds(tier))
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&TtlTiersConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_ordered() {
        let policy = TtlPolicy::default();
        let secs: Vec<u64> = TtlTier::ALL.iter().map(|t| policy.seconds(*t)).collect();
        assert_eq!(secs, vec![300, 1800, 3600, 86_400]);
    }

    #[test]
    fn test_huge_ttls_are_clamped() {
        let now = Instant::now();
        let at = deadline(now, Duration::from_secs(u64::MAX)).expect("representable");
        assert_eq!(at - now, MAX_TTL);
        assert_eq!(expiry_millis(Duration::MAX), MAX_TTL.as_millis() as u64);
        assert_eq!(expiry_millis(Duration::ZERO), 1);
        assert_eq!(expiry_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_policy_from_config() {
        let config = TtlTiersConfig {
            short: 10,
            ..TtlTiersConfig::default()
        };
        let policy = TtlPolicy::from_config(&config);
        assert_eq!(policy.duration(TtlTier::Short), Duration::from_secs(10));
        assert_eq!(policy.duration(TtlTier::Long), Duration::from_secs(3600));
    }
}
