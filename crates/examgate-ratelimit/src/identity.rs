//! Client identity derivation.
//!
//! The address comes from the connection, or from proxy headers when the
//! deployment trusts them. Route classes may append a request-carried correlator (an
//! access code header, an attempt id in the query, a path segment) so that
//! clients behind one NAT are counted separately per resource.

use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use examgate_config::IdentitySource;

/// Longest correlator value kept in a counter key.
const MAX_CORRELATOR_LEN: usize = 128;

/// Used when neither proxy headers nor the connection reveal an address.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Client address.
///
/// With `trust_proxy_headers` the order is `X-Forwarded-For` (first hop),
/// `X-Real-IP`, then the connection. Without it the headers are ignored, since
/// any direct client can set them.
pub fn client_address(
    headers: &HeaderMap,
    connect: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    let from_connection = || connect.map(|addr| addr.ip());
    if !trust_proxy_headers {
        return from_connection()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
    };

    forwarded
        .or_else(real_ip)
        .or_else(from_connection)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

/// Composite identity for a route class: the address alone, or
/// `{address}:{correlator}`. A missing correlator counts as `-`.
pub fn derive_identity(
    source: &IdentitySource,
    address: &str,
    headers: &HeaderMap,
    uri: &Uri,
) -> String {
    let correlator = match source {
        IdentitySource::Address => return address.to_string(),
        IdentitySource::Header(name) => headers
            .get(name.as_str())
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
        IdentitySource::Query(name) => Query::<HashMap<String, String>>::try_from_uri(uri)
            .ok()
            .and_then(|Query(mut params)| params.remove(name)),
        IdentitySource::PathSegment(index) => uri
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .nth(*index)
            .map(str::to_string),
    };

    let correlator = correlator
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .map(|c| c.chars().take(MAX_CORRELATOR_LEN).collect::<String>())
        .unwrap_or_else(|| "-".to_string());

    format!("{address}:{correlator}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_client_address_precedence() {
        let conn: SocketAddr = "192.0.2.9:5000".parse().unwrap();

        let h = headers(&[
            ("x-forwarded-for", "203.0.113.5, 10.0.0.1"),
            ("x-real-ip", "198.51.100.7"),
        ]);
        assert_eq!(client_address(&h, Some(conn), true), "203.0.113.5");

        let h = headers(&[("x-real-ip", "198.51.100.7")]);
        assert_eq!(client_address(&h, Some(conn), true), "198.51.100.7");

        let h = headers(&[("x-forwarded-for", "not-an-ip")]);
        assert_eq!(client_address(&h, Some(conn), true), "192.0.2.9");

        assert_eq!(client_address(&HeaderMap::new(), None, true), UNKNOWN_ADDRESS);
    }

    #[test]
    fn test_proxy_headers_ignored_unless_trusted() {
        let conn: SocketAddr = "192.0.2.9:5000".parse().unwrap();
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.5"),
            ("x-real-ip", "198.51.100.7"),
        ]);
        assert_eq!(client_address(&h, Some(conn), false), "192.0.2.9");
        assert_eq!(client_address(&h, None, false), UNKNOWN_ADDRESS);
    }

    #[test]
    fn test_derive_identity_sources() {
        let h = headers(&[("x-access-code", "ABC123")]);
        let uri: Uri = "/tests/77/attempts?attempt=9".parse().unwrap();

        assert_eq!(
            derive_identity(&IdentitySource::Address, "1.2.3.4", &h, &uri),
            "1.2.3.4"
        );
        assert_eq!(
            derive_identity(
                &IdentitySource::Header("x-access-code".into()),
                "1.2.3.4",
                &h,
                &uri
            ),
            "1.2.3.4:ABC123"
        );
        assert_eq!(
            derive_identity(&IdentitySource::Query("attempt".into()), "1.2.3.4", &h, &uri),
            "1.2.3.4:9"
        );
        assert_eq!(
            derive_identity(&IdentitySource::PathSegment(1), "1.2.3.4", &h, &uri),
            "1.2.3.4:77"
        );
    }

    #[test]
    fn test_missing_correlator() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(
            derive_identity(
                &IdentitySource::Header("x-access-code".into()),
                "1.2.3.4",
                &HeaderMap::new(),
                &uri
            ),
            "1.2.3.4:-"
        );
    }
}
