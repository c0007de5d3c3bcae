//! Process-wide services, constructed once by the entry point and passed to
//! whatever needs them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use examgate_cache::{
    CacheInvalidationListener, HybridCache, Invalidator, RemoteStore, SharedStore, SweeperHandle,
    connect_remote_store,
};
use examgate_config::AppConfig;
use examgate_ratelimit::{RateLimiters, start_abuse_pruner};

use crate::error::ServerError;

const ABUSE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Services {
    pub config: Arc<AppConfig>,
    pub store: SharedStore,
    pub cache: HybridCache,
    pub invalidator: Invalidator,
    pub limiters: Arc<RateLimiters>,
    cancel: CancellationToken,
    sweeper: Option<SweeperHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Services {
    /// Connect the remote store and start the background tasks.
    ///
    /// Fails only on unusable configuration; an unreachable Redis leaves the
    /// services running in degraded mode.
    pub async fn init(config: &AppConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store = connect_remote_store(&config.redis).await?;
        let mut services = Self::with_store(config, store);

        services.sweeper = Some(
            services
                .cache
                .start_sweeper(config.cache.sweep_interval()),
        );

        if let Some(channel) = &config.cache.invalidation_channel {
            let listener =
                CacheInvalidationListener::new(&config.redis.url, channel, services.cache.clone());
            services.tasks.push(listener.start(services.cancel.clone()));
        }

        if let Some(adaptive) = services.limiters.adaptive() {
            services.tasks.push(adaptive.start_sampler(
                config.rate_limit.adaptive.sample_interval(),
                services.cancel.clone(),
            ));
        }

        if services.limiters.abuse().is_some() {
            services.tasks.push(start_abuse_pruner(
                services.limiters.clone(),
                ABUSE_PRUNE_INTERVAL,
                services.cancel.clone(),
            ));
        }

        let remote_available = services.cache.is_remote_available().await;
        tracing::info!(
            store = services.store.name(),
            remote_available,
            "services initialized"
        );
        Ok(services)
    }

    /// Build the services over an existing store without background tasks.
    pub fn with_store(config: &AppConfig, store: SharedStore) -> Self {
        let cache = HybridCache::new(&config.cache, store.clone());
        let limiters = Arc::new(RateLimiters::from_config(&config.rate_limit, store.clone()));
        Self {
            config: Arc::new(config.clone()),
            store,
            invalidator: Invalidator::new(cache.clone()),
            cache,
            limiters,
            cancel: CancellationToken::new(),
            sweeper: None,
            tasks: Vec::new(),
        }
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Some(sweeper) = self.sweeper {
            sweeper.shutdown().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("services closed");
    }
}
