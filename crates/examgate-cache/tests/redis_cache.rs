//! Integration tests against a real Redis.
//!
//! A single container is shared by every test in this file; each test uses its
//! own key namespace.

use examgate_cache::{HybridCache, RemoteStore, SharedStore, connect_remote_store};
use examgate_config::{CacheConfig, RedisConfig};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn store() -> SharedStore {
    let config = RedisConfig {
        url: get_redis_url().await,
        pool_size: 4,
        timeout_ms: 2000,
    };
    connect_remote_store(&config).await.expect("connect")
}

fn cache_config(prefix: &str) -> CacheConfig {
    CacheConfig {
        key_prefix: format!("{prefix}:cache:"),
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn test_set_get_across_instances() {
    let store = store().await;
    let config = cache_config("across");
    let writer = HybridCache::new(&config, store.clone());
    let reader = HybridCache::new(&config, store);

    writer.set("school:42", &"North High", 3600).await.unwrap();
    assert_eq!(
        reader.get::<String>("school:42").await.as_deref(),
        Some("North High")
    );
}

#[tokio::test]
async fn test_delete_is_visible_to_fresh_instance() {
    let store = store().await;
    let config = cache_config("del");
    let cache = HybridCache::new(&config, store.clone());

    cache.set("k", &1u32, 3600).await.unwrap();
    assert!(cache.del("k").await);

    let fresh = HybridCache::new(&config, store);
    assert_eq!(fresh.get::<u32>("k").await, None);
}

#[tokio::test]
async fn test_school_scenario() {
    let store = store().await;
    let cache = HybridCache::new(&cache_config("e2e"), store);

    cache.set("school:42", &"North High", 3600).await.unwrap();
    assert!(cache.get::<String>("school:42").await.is_some());
    assert_eq!(cache.del_pattern("school:42*").await, 1);
    assert_eq!(cache.get::<String>("school:42").await, None);
}

#[tokio::test]
async fn test_del_pattern_exact_count() {
    let store = store().await;
    let cache = HybridCache::new(&cache_config("pattern"), store);

    for i in 0..25 {
        cache.set(&format!("prefix:{i}"), &i, 60).await.unwrap();
    }
    cache.set("other:1", &1u32, 60).await.unwrap();

    assert_eq!(cache.del_pattern("prefix:*").await, 25);
    assert_eq!(cache.del_pattern("prefix:*").await, 0);
    assert_eq!(cache.get::<u32>("other:1").await, Some(1));
}

#[tokio::test]
async fn test_ttl_expiry() {
    let store = store().await;
    let config = CacheConfig {
        local_ceiling_secs: 1,
        ..cache_config("ttl")
    };
    let cache = HybridCache::new(&config, store);

    cache.set("short", &1u32, 1).await.unwrap();
    assert_eq!(cache.get::<u32>("short").await, Some(1));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(cache.get::<u32>("short").await, None);
}

#[tokio::test]
async fn test_incr_window_is_atomic_and_expires() {
    let store = store().await;
    let window = Duration::from_millis(500);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.incr_window("it:rl:counter", 1, window).await.unwrap()
        }));
    }
    let mut counts = Vec::new();
    for handle in handles {
        counts.push(handle.await.unwrap());
    }
    counts.sort();
    assert_eq!(counts, (1..=20).collect::<Vec<_>>());

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(store.incr_window("it:rl:counter", 1, window).await.unwrap(), 1);
}

#[tokio::test]
async fn test_decr_existing_never_goes_negative() {
    let store = store().await;
    assert_eq!(store.decr_existing("it:rl:missing").await.unwrap(), None);
    store
        .incr_window("it:rl:decr", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.decr_existing("it:rl:decr").await.unwrap(), Some(0));
    assert_eq!(store.decr_existing("it:rl:decr").await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_redis_degrades() {
    let config = RedisConfig {
        url: "redis://127.0.0.1:1".to_string(),
        pool_size: 2,
        timeout_ms: 200,
    };
    let store = connect_remote_store(&config).await.expect("pool builds");
    let cache = HybridCache::new(&CacheConfig::default(), store);

    assert!(cache.set("k", &1u32, 60).await.unwrap());
    assert_eq!(cache.get::<u32>("k").await, Some(1));
    assert!(!cache.is_remote_available().await);
}
