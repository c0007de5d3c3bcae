//! Redis Pub/Sub for cross-instance tier-1 invalidation.
//!
//! ```text
//! Instance 1: cache.del_pattern("test:7*")
//!   ↓
//! PUBLISH cache:invalidate "pattern:test:7*"
//!   ↓
//! Instance 2: listener receives it → evicts matching L1 entries
//! ```
//!
//! Without this, other instances keep serving their tier-1 copy until the
//! local ceiling expires it.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::hybrid::HybridCache;

const KEY_PREFIX: &str = "key:";
const PATTERN_PREFIX: &str = "pattern:";
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Payload published on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMessage {
    Key(String),
    Pattern(String),
}

impl InvalidationMessage {
    pub fn encode(&self) -> String {
        match self {
            Self::Key(key) => format!("{KEY_PREFIX}{key}"),
            Self::Pattern(pattern) => format!("{PATTERN_PREFIX}{pattern}"),
        }
    }

    pub fn parse(payload: &str) -> Option<Self> {
        if let Some(key) = payload.strip_prefix(KEY_PREFIX) {
            Some(Self::Key(key.to_string()))
        } else {
            payload
                .strip_prefix(PATTERN_PREFIX)
                .map(|p| Self::Pattern(p.to_string()))
        }
    }
}

/// Subscribes to the invalidation channel and evicts tier-1 entries named by
/// other instances. Reconnects with exponential backoff.
pub struct CacheInvalidationListener {
    redis_url: String,
    channel: String,
    cache: HybridCache,
}

impl CacheInvalidationListener {
    pub fn new(redis_url: impl Into<String>, channel: impl Into<String>, cache: HybridCache) -> Self {
        Self {
            redis_url: redis_url.into(),
            channel: channel.into(),
            cache,
        }
    }

    /// Spawn the listener; it runs until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);

            loop {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = self.run() => outcome,
                };

                match outcome {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "cache invalidation listener error, reconnecting"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
            tracing::info!(channel = %self.channel, "cache invalidation listener stopped");
        })
    }

    async fn run(&self) -> StoreResult<()> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        tracing::info!(channel = %self.channel, "subscribed to cache invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let Ok(payload) = msg.get_payload::<String>() else {
                tracing::warn!("failed to read invalidation message payload");
                continue;
            };
            match InvalidationMessage::parse(&payload) {
                Some(message) => {
                    let removed = self.cache.apply_invalidation(&message);
                    tracing::debug!(payload = %payload, removed, "applied cache invalidation");
                }
                None => tracing::warn!(payload = %payload, "unknown invalidation message"),
            }
        }
        Err(StoreError::unavailable("pub/sub connection closed"))
    }
}
