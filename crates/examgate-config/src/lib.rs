//! Configuration for the examgate services.
//!
//! Every section deserializes with serde defaults so a minimal file only needs
//! the values that have no sensible default: the Redis URL and the rate-limit
//! route classes. [`AppConfig::validate`] is the fail-fast gate run at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

pub mod loader;

pub use loader::{load_config, load_config_with_default_path};

/// Error types for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("unknown route class: {0}")]
    MissingRouteClass(String),
}

impl ConfigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote store (tier 2 and rate-limit counters)
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ConfigError::validation("server.port must be > 0"));
        }

        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::validation(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }

        self.redis.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

/// Redis connection settings.
///
/// The URL has no default: every deployment must say where the shared store
/// lives. An unreachable store at startup is not an error, the services
/// degrade and the pool reconnects lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Upper bound for every pool checkout and command, in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    500
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::validation("redis.url is required"));
        }
        if !(self.url.starts_with("redis://")
            || self.url.starts_with("rediss://")
            || self.url.starts_with("redis+unix://"))
        {
            return Err(ConfigError::validation(
                "redis.url must use the redis://, rediss:// or redis+unix:// scheme",
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::validation("redis.pool_size must be > 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::validation("redis.timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Hybrid cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on the lifetime of any tier-1 (local) entry, in seconds
    #[serde(default = "default_local_ceiling_secs")]
    pub local_ceiling_secs: u64,

    /// Local (L1) cache max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// How often expired tier-1 entries are swept, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Namespace prepended to every tier-2 cache key
    #[serde(default = "default_cache_key_prefix")]
    pub key_prefix: String,

    /// Pub/Sub channel used to evict tier-1 entries on other instances.
    /// Cross-instance eviction is off when unset.
    #[serde(default)]
    pub invalidation_channel: Option<String>,

    #[serde(default)]
    pub ttl: TtlTiersConfig,
}

fn default_local_ceiling_secs() -> u64 {
    300
}
fn default_local_max_entries() -> usize {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_cache_key_prefix() -> String {
    "cache:".into()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ceiling_secs: default_local_ceiling_secs(),
            local_max_entries: default_local_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            key_prefix: default_cache_key_prefix(),
            invalidation_channel: None,
            ttl: TtlTiersConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn local_ceiling(&self) -> Duration {
        Duration::from_secs(self.local_ceiling_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.local_ceiling_secs == 0 {
            return Err(ConfigError::validation("cache.local_ceiling_secs must be > 0"));
        }
        if self.local_max_entries == 0 {
            return Err(ConfigError::validation("cache.local_max_entries must be > 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation("cache.sweep_interval_secs must be > 0"));
        }
        if let Some(channel) = &self.invalidation_channel
            && channel.trim().is_empty()
        {
            return Err(ConfigError::validation(
                "cache.invalidation_channel must not be empty when set",
            ));
        }
        self.ttl.validate()
    }
}

/// TTL tier durations in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlTiersConfig {
    #[serde(default = "default_ttl_short")]
    pub short: u64,
    #[serde(default = "default_ttl_medium")]
    pub medium: u64,
    #[serde(default = "default_ttl_long")]
    pub long: u64,
    #[serde(default = "default_ttl_very_long")]
    pub very_long: u64,
}

fn default_ttl_short() -> u64 {
    300 // 5 minutes
}
fn default_ttl_medium() -> u64 {
    1800 // 30 minutes
}
fn default_ttl_long() -> u64 {
    3600 // 1 hour
}
fn default_ttl_very_long() -> u64 {
    86_400 // 24 hours
}

impl Default for TtlTiersConfig {
    fn default() -> Self {
        Self {
            short: default_ttl_short(),
            medium: default_ttl_medium(),
            long: default_ttl_long(),
            very_long: default_ttl_very_long(),
        }
    }
}

impl TtlTiersConfig {
    fn validate(&self) -> Result<()> {
        if self.short == 0 {
            return Err(ConfigError::validation("cache.ttl.short must be > 0"));
        }
        if !(self.short <= self.medium && self.medium <= self.long && self.long <= self.very_long)
        {
            return Err(ConfigError::validation(
                "cache.ttl tiers must satisfy short <= medium <= long <= very_long",
            ));
        }
        Ok(())
    }
}

/// How a route class derives the identity it counts requests against.
///
/// In TOML: `identity = "address"`, `identity = { header = "x-access-code" }`,
/// `identity = { query = "attempt" }` or `identity = { path_segment = 2 }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Client network address alone
    #[default]
    Address,
    /// Address plus the value of a request header
    Header(String),
    /// Address plus the value of a query parameter
    Query(String),
    /// Address plus the n-th (0-based) non-empty path segment
    PathSegment(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteClassConfig {
    pub window_ms: u64,
    pub max: u64,
    #[serde(default)]
    pub identity: IdentitySource,
    /// Only requests that end in an error status count against the window
    #[serde(default)]
    pub skip_successful_requests: bool,
}

impl RouteClassConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,

    /// Namespace prepended to every counter key in the remote store
    #[serde(default = "default_rate_limit_key_prefix")]
    pub key_prefix: String,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a reverse proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,

    #[serde(default)]
    pub route_classes: BTreeMap<String, RouteClassConfig>,

    #[serde(default)]
    pub slow_down: SlowDownConfig,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    #[serde(default)]
    pub abuse: AbuseConfig,
}

fn default_rate_limit_enabled() -> bool {
    true
}
fn default_rate_limit_key_prefix() -> String {
    "rl".into()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            key_prefix: default_rate_limit_key_prefix(),
            trust_proxy_headers: false,
            route_classes: BTreeMap::new(),
            slow_down: SlowDownConfig::default(),
            adaptive: AdaptiveConfig::default(),
            abuse: AbuseConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Look up a route class, failing when it is not configured.
    pub fn route_class(&self, name: &str) -> Result<&RouteClassConfig> {
        self.route_classes
            .get(name)
            .ok_or_else(|| ConfigError::MissingRouteClass(name.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::validation("rate_limit.key_prefix must not be empty"));
        }
        if self.route_classes.is_empty() {
            return Err(ConfigError::validation(
                "rate_limit.route_classes must define at least one route class",
            ));
        }
        for (name, class) in &self.route_classes {
            if name.contains(':') {
                return Err(ConfigError::validation(format!(
                    "rate_limit.route_classes.{name}: name must not contain ':'"
                )));
            }
            if class.window_ms == 0 {
                return Err(ConfigError::validation(format!(
                    "rate_limit.route_classes.{name}.window_ms must be > 0"
                )));
            }
            if class.max == 0 {
                return Err(ConfigError::validation(format!(
                    "rate_limit.route_classes.{name}.max must be > 0"
                )));
            }
            if let IdentitySource::Header(h) | IdentitySource::Query(h) = &class.identity
                && h.trim().is_empty()
            {
                return Err(ConfigError::validation(format!(
                    "rate_limit.route_classes.{name}.identity names an empty field"
                )));
            }
        }
        self.slow_down.validate()?;
        self.adaptive.validate()?;
        self.abuse.validate()
    }
}

/// Graduated delay applied past `delay_after` requests in a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowDownConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_slow_down_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_slow_down_delay_after")]
    pub delay_after: u64,
    #[serde(default = "default_slow_down_delay_step_ms")]
    pub delay_step_ms: u64,
    #[serde(default = "default_slow_down_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_slow_down_window_ms() -> u64 {
    15 * 60 * 1000
}
fn default_slow_down_delay_after() -> u64 {
    50
}
fn default_slow_down_delay_step_ms() -> u64 {
    100
}
fn default_slow_down_max_delay_ms() -> u64 {
    2_000
}

impl Default for SlowDownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: default_slow_down_window_ms(),
            delay_after: default_slow_down_delay_after(),
            delay_step_ms: default_slow_down_delay_step_ms(),
            max_delay_ms: default_slow_down_max_delay_ms(),
        }
    }
}

impl SlowDownConfig {
    fn validate(&self) -> Result<()> {
        if self.enabled && self.window_ms == 0 {
            return Err(ConfigError::validation("rate_limit.slow_down.window_ms must be > 0"));
        }
        Ok(())
    }
}

/// Extra per-client throttle that only engages under memory pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Resident set size above which the adaptive counter is consulted
    #[serde(default = "default_adaptive_memory_threshold")]
    pub memory_threshold_bytes: u64,
    #[serde(default = "default_adaptive_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_adaptive_max")]
    pub max: u64,
    /// How often the process memory reading is refreshed
    #[serde(default = "default_adaptive_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_adaptive_memory_threshold() -> u64 {
    1024 * 1024 * 1024
}
fn default_adaptive_window_ms() -> u64 {
    60_000
}
fn default_adaptive_max() -> u64 {
    10
}
fn default_adaptive_sample_interval_ms() -> u64 {
    1_000
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            memory_threshold_bytes: default_adaptive_memory_threshold(),
            window_ms: default_adaptive_window_ms(),
            max: default_adaptive_max(),
            sample_interval_ms: default_adaptive_sample_interval_ms(),
        }
    }
}

impl AdaptiveConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.enabled
            && (self.window_ms == 0 || self.max == 0 || self.sample_interval_ms == 0)
        {
            return Err(ConfigError::validation(
                "rate_limit.adaptive.window_ms, max and sample_interval_ms must be > 0",
            ));
        }
        Ok(())
    }
}

/// In-process abuse heuristic, independent of the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseConfig {
    #[serde(default = "default_abuse_enabled")]
    pub enabled: bool,
    #[serde(default = "default_abuse_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_abuse_max")]
    pub max: u64,
    /// How long a flagged address stays rejected
    #[serde(default = "default_abuse_block_ms")]
    pub block_ms: u64,
}

fn default_abuse_enabled() -> bool {
    true
}
fn default_abuse_window_ms() -> u64 {
    10_000
}
fn default_abuse_max() -> u64 {
    300
}
fn default_abuse_block_ms() -> u64 {
    60_000
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: default_abuse_enabled(),
            window_ms: default_abuse_window_ms(),
            max: default_abuse_max(),
            block_ms: default_abuse_block_ms(),
        }
    }
}

impl AbuseConfig {
    fn validate(&self) -> Result<()> {
        if self.enabled && (self.window_ms == 0 || self.max == 0) {
            return Err(ConfigError::validation(
                "rate_limit.abuse.window_ms and max must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.redis.url = "redis://localhost:6379".into();
        cfg.rate_limit.route_classes.insert(
            "general".into(),
            RouteClassConfig {
                window_ms: 60_000,
                max: 100,
                identity: IdentitySource::Address,
                skip_successful_requests: false,
            },
        );
        cfg
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_default_ttl_tiers() {
        let ttl = TtlTiersConfig::default();
        assert_eq!(ttl.short, 300);
        assert_eq!(ttl.medium, 1800);
        assert_eq!(ttl.long, 3600);
        assert_eq!(ttl.very_long, 86_400);
    }

    #[test]
    fn test_missing_redis_url_fails() {
        let mut cfg = valid_config();
        cfg.redis.url.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("redis.url"));
    }

    #[test]
    fn test_bad_redis_scheme_fails() {
        let mut cfg = valid_config();
        cfg.redis.url = "http://localhost:6379".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_route_classes_fail_when_enabled() {
        let mut cfg = valid_config();
        cfg.rate_limit.route_classes.clear();
        assert!(cfg.validate().is_err());

        cfg.rate_limit.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_window_fails() {
        let mut cfg = valid_config();
        if let Some(class) = cfg.rate_limit.route_classes.get_mut("general") {
            class.window_ms = 0;
        }
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("general.window_ms"));
    }

    #[test]
    fn test_unordered_ttl_tiers_fail() {
        let mut cfg = valid_config();
        cfg.cache.ttl.medium = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_route_class_lookup() {
        let cfg = valid_config();
        assert_eq!(cfg.rate_limit.route_class("general").unwrap().max, 100);
        assert!(matches!(
            cfg.rate_limit.route_class("auth"),
            Err(ConfigError::MissingRouteClass(_))
        ));
    }

    #[test]
    fn test_invalid_log_level_fails() {
        let mut cfg = valid_config();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());
    }
}
