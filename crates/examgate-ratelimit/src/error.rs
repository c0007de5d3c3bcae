use examgate_cache::StoreError;
use examgate_config::ConfigError;

/// Errors from operator actions on the limiters.
///
/// Request-path checks never fail; they admit the request instead.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
