//! Redis-backed [`RemoteStore`] over a deadpool connection pool.

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use examgate_config::RedisConfig;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use super::{RemoteStore, StoredValue};
use crate::error::{StoreError, StoreResult};
use crate::ttl::expiry_millis;

/// SCAN batch size for pattern deletes.
const SCAN_COUNT: usize = 200;

/// INCRBY and set the expiry only when the counter has none, in one round-trip.
static INCR_WINDOW: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
",
    )
});

/// DECR only a positive counter; -1 signals nothing was decremented.
static DECR_EXISTING: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
  return redis.call('DECR', KEYS[1])
end
return -1
",
    )
});

/// Remote store backed by Redis.
///
/// Every pool checkout and every command is wrapped in `timeout`; hitting it
/// is reported as [`StoreError::Timeout`].
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<Connection> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

/// Build a Redis store from configuration.
///
/// Only a malformed URL or pool setup fails here. An unreachable server is
/// logged and tolerated: the pool connects lazily and calls degrade until the
/// server comes back.
pub async fn connect_redis_store(config: &RedisConfig) -> StoreResult<RedisStore> {
    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = config.timeout();
    let mut pool_config = PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| StoreError::unavailable(format!("failed to create Redis pool: {e}")))?;

    let store = RedisStore::new(pool, timeout);
    match store.ping().await {
        Ok(()) => tracing::info!("Connected to Redis"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis not reachable at startup, continuing in degraded mode"
        ),
    }
    Ok(store)
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let mut conn = self.conn().await?;
        let (data, pttl): (Option<Vec<u8>>, i64) = self
            .bounded(redis::pipe().get(key).pttl(key).query_async(&mut conn))
            .await?;

        Ok(data.map(|data| StoredValue {
            data,
            ttl: (pttl > 0).then(|| Duration::from_millis(pttl as u64)),
        }))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let millis = expiry_millis(ttl);
        self.bounded(conn.pset_ex::<_, _, ()>(key, value, millis))
            .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn del_pattern(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;

        // SCAN may return a key more than once
        let mut matched = HashSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn),
                )
                .await?;
            matched.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if matched.is_empty() {
            return Ok(Vec::new());
        }

        // One DEL per key so the result says exactly which keys were removed
        let keys: Vec<String> = matched.into_iter().collect();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.del(key);
        }
        let removed: Vec<i64> = self.bounded(pipe.query_async(&mut conn)).await?;

        Ok(keys
            .into_iter()
            .zip(removed)
            .filter(|(_, n)| *n > 0)
            .map(|(key, _)| key)
            .collect())
    }

    async fn incr_window(&self, key: &str, delta: i64, window: Duration) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let millis = expiry_millis(window);
        self.bounded(
            INCR_WINDOW
                .key(key)
                .arg(delta)
                .arg(millis)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn().await?;
        let value: i64 = self
            .bounded(DECR_EXISTING.key(key).invoke_async(&mut conn))
            .await?;
        Ok((value >= 0).then_some(value))
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        self.bounded(conn.publish::<_, _, ()>(channel, message))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}
