//! Operator endpoint tests over an in-process store.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use examgate_cache::MemoryStore;
use examgate_config::{AppConfig, IdentitySource, RouteClassConfig};
use examgate_server::{AppState, Services, build_router};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

fn config(general_max: u64) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.url = "redis://127.0.0.1:6379".into();
    cfg.rate_limit.abuse.enabled = false;
    cfg.rate_limit.trust_proxy_headers = true;
    cfg.rate_limit.route_classes.insert(
        "general".into(),
        RouteClassConfig {
            window_ms: 60_000,
            max: general_max,
            identity: IdentitySource::Address,
            skip_successful_requests: false,
        },
    );
    cfg
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "192.0.2.10")
        .body(Body::empty())
        .unwrap()
}

async fn json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_healthz_reports_degraded_store() {
    let store = Arc::new(MemoryStore::new());
    let services = Services::with_store(&config(100), store.clone());
    let app = build_router(AppState::from_services(&services));

    let resp = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json(resp).await["status"], "ok");

    store.set_available(false);
    let resp = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json(resp).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["remoteStore"], false);
}

#[tokio::test]
async fn test_cache_metrics_snapshot_and_reset() {
    let services = Services::with_store(&config(100), Arc::new(MemoryStore::new()));
    services.cache.set("school:42", &"North", 3600).await.unwrap();
    services.cache.get::<String>("school:42").await;
    services.cache.get::<String>("school:43").await;

    let app = build_router(AppState::from_services(&services));
    let resp = app.clone().oneshot(get("/metrics/cache")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json(resp).await;
    assert_eq!(body["hits"], 1);
    assert_eq!(body["misses"], 1);
    assert_eq!(body["trackedEntries"], 1);
    assert_eq!(body["hitRate"], 50.0);

    let reset = Request::builder()
        .method("POST")
        .uri("/metrics/cache/reset")
        .header("x-forwarded-for", "192.0.2.10")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(reset).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let body = json(app.oneshot(get("/metrics/cache")).await.unwrap()).await;
    assert_eq!(body["hits"], 0);
}

#[tokio::test]
async fn test_operator_routes_are_rate_limited() {
    let services = Services::with_store(&config(2), Arc::new(MemoryStore::new()));
    let app = build_router(AppState::from_services(&services));

    for _ in 0..2 {
        let resp = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn test_services_close_without_background_tasks() {
    let services = Services::with_store(&config(100), Arc::new(MemoryStore::new()));
    services.close().await;
}
