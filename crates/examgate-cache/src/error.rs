use std::time::Duration;

/// Failure talking to the shared remote store.
///
/// Every variant is the same thing to callers of the cache and the limiters:
/// the remote tier is unhealthy, degrade and carry on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote store command failed: {0}")]
    Command(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors the hybrid cache surfaces to its callers.
///
/// Remote failures are swallowed on the data path; they only appear here from
/// explicit diagnostics such as [`crate::HybridCache::ping_remote`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
