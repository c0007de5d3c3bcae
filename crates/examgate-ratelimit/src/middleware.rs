//! Axum middleware enforcing one route class.
//!
//! Layers, in order: abuse block (in-process), memory-pressure throttle,
//! route-class window limit, slow-down delay. Allowed responses carry
//! `X-RateLimit-*` headers; denials are 429 with `Retry-After`.
//!
//! ```ignore
//! let auth = RouteRateLimit::new(limiters.clone(), "auth");
//! Router::new()
//!     .route("/login", post(login))
//!     .layer(middleware::from_fn_with_state(auth, rate_limit_middleware));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::abuse::AbuseVerdict;
use crate::identity::{client_address, derive_identity};
use crate::limiter::{Allowance, RateDecision};
use crate::registry::RateLimiters;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Middleware state: the shared limiters plus the route class to enforce.
#[derive(Clone)]
pub struct RouteRateLimit {
    limiters: Arc<RateLimiters>,
    route_class: Arc<str>,
}

impl RouteRateLimit {
    pub fn new(limiters: Arc<RateLimiters>, route_class: &str) -> Self {
        Self {
            limiters,
            route_class: Arc::from(route_class),
        }
    }
}

/// A request turned away by one of the limiting layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooManyRequests { limit: u64, retry_after: Duration },
    Blocked { retry_after: Duration },
    Overloaded,
}

/// Whole seconds, rounded up, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_millis().div_ceil(1000).max(1) as u64
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::TooManyRequests { limit, retry_after } => {
                let body = json!({
                    "error": "too_many_requests",
                    "message": "Too many requests, please try again later",
                    "retryAfterMs": retry_after.as_millis() as u64,
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
                headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
                headers.insert(
                    X_RATELIMIT_RESET,
                    HeaderValue::from(retry_after_secs(retry_after)),
                );
                response
            }
            Rejection::Blocked { retry_after } => {
                let body = json!({
                    "error": "blocked",
                    "message": "Too many requests from this address",
                    "retryAfterMs": retry_after.as_millis() as u64,
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
                response
            }
            Rejection::Overloaded => {
                let body = json!({
                    "error": "overloaded",
                    "message": "System overloaded, please try again later",
                });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
        }
    }
}

fn apply_headers(headers: &mut HeaderMap, allowance: &Allowance) {
    if allowance.limit == 0 {
        return;
    }
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(allowance.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(allowance.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(retry_after_secs(allowance.reset_after)),
    );
}

/// Rate limiting middleware for one route class.
///
/// Limiter infrastructure failures are invisible to clients: every layer
/// admits the request when the remote store is unreachable.
pub async fn rate_limit_middleware(
    State(state): State<RouteRateLimit>,
    request: Request,
    next: Next,
) -> Response {
    let limiters = &state.limiters;
    if !limiters.enabled() {
        return next.run(request).await;
    }

    let connect = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let address = client_address(request.headers(), connect, limiters.trust_proxy_headers());

    if let Some(abuse) = limiters.abuse()
        && let AbuseVerdict::Blocked { retry_after } = abuse.check(&address)
    {
        return Rejection::Blocked { retry_after }.into_response();
    }

    if limiters.overloaded(&address).await {
        return Rejection::Overloaded.into_response();
    }

    let Some(limiter) = limiters.limiter(&state.route_class) else {
        tracing::error!(route_class = %state.route_class, "unknown rate limit route class, allowing request");
        return next.run(request).await;
    };

    let identity = derive_identity(
        &limiter.config().identity,
        &address,
        request.headers(),
        request.uri(),
    );

    let allowance = match limiter.check(&identity).await {
        RateDecision::Allowed(allowance) => allowance,
        RateDecision::Denied { limit, retry_after } => {
            tracing::info!(
                route_class = %state.route_class,
                identity = %identity,
                retry_after_ms = retry_after.as_millis() as u64,
                "request rate limited"
            );
            return Rejection::TooManyRequests { limit, retry_after }.into_response();
        }
    };

    let delay = limiters.slow_down_delay(&address).await;
    if !delay.is_zero() {
        tracing::debug!(address = %address, delay_ms = delay.as_millis() as u64, "slowing down client");
        tokio::time::sleep(delay).await;
    }

    let mut response = next.run(request).await;

    if limiter.config().skip_successful_requests && response.status().as_u16() < 400 {
        limiter.refund(&allowance).await;
    }
    apply_headers(response.headers_mut(), &allowance);
    response
}
