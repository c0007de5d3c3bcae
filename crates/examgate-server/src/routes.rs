//! Operator HTTP surface: health, cache metrics, Prometheus.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use examgate_cache::HybridCache;
use examgate_ratelimit::{RateLimiters, RouteRateLimit, rate_limit_middleware};

use crate::prometheus::render_metrics;
use crate::services::Services;

/// Route class applied to the operator endpoints.
pub const OPERATOR_ROUTE_CLASS: &str = "general";

#[derive(Clone)]
pub struct AppState {
    pub cache: HybridCache,
    pub limiters: Arc<RateLimiters>,
}

impl AppState {
    pub fn from_services(services: &Services) -> Self {
        Self {
            cache: services.cache.clone(),
            limiters: services.limiters.clone(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let limiters = state.limiters.clone();

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics/cache", get(cache_metrics))
        .route("/metrics/cache/reset", post(reset_cache_metrics))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    let router = if limiters.limiter(OPERATOR_ROUTE_CLASS).is_some() {
        router.layer(middleware::from_fn_with_state(
            RouteRateLimit::new(limiters, OPERATOR_ROUTE_CLASS),
            rate_limit_middleware,
        ))
    } else {
        tracing::warn!(
            route_class = OPERATOR_ROUTE_CLASS,
            "route class not configured, operator endpoints are not rate limited"
        );
        router
    };

    router.layer(TraceLayer::new_for_http())
}

/// Always 200: a degraded remote tier is reported, not failed on.
async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let remote = state.cache.is_remote_available().await;
    let status = if remote { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "remoteStore": remote,
    }))
}

async fn cache_metrics(State(state): State<AppState>) -> Response {
    Json(state.cache.metrics()).into_response()
}

async fn reset_cache_metrics(State(state): State<AppState>) -> StatusCode {
    state.cache.reset_metrics();
    tracing::info!("cache metrics reset by operator");
    StatusCode::NO_CONTENT
}

async fn prometheus_metrics() -> Response {
    match render_metrics() {
        Some(body) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
