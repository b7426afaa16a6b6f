//! HTTP header processing: client IP extraction, hop-by-hop removal,
//! forwarding header injection, and host rewriting.
//!
//! Implements the header-level requirements of RFC 7230 Section 6.1
//! (hop-by-hop handling) and the de-facto `X-Forwarded-*` / `X-Real-IP`
//! conventions for reverse proxies.

use std::net::{IpAddr, SocketAddr};

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// Correlation id header, inbound and outbound.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Resolves the client IP for a request.
///
/// Prefers the first entry of `X-Forwarded-For` when it parses as an IP
/// literal, so the gateway honours addresses recorded by an outer load
/// balancer. Falls back to the peer address of the TCP connection, which
/// always yields a valid IP.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

/// The connection-scoped header set of RFC 7230 Section 6.1. These are
/// meaningful for a single transport hop only and must not cross the
/// proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Drops connection-scoped headers before a request crosses the proxy
/// boundary: everything in [`HOP_BY_HOP`], plus whatever names the
/// `Connection` header nominates for this hop.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = match headers.get(hyper::header::CONNECTION) {
        Some(value) => value
            .to_str()
            .unwrap_or_default()
            .split(',')
            .filter_map(|name| name.trim().parse::<HeaderName>().ok())
            .collect(),
        None => Vec::new(),
    };

    for name in &nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Injects the forwarding headers carried to the upstream.
///
/// - `X-Real-IP` is set to the resolved client IP.
/// - `X-Forwarded-For` appends the resolved client IP to any existing
///   value, preserving outer proxy chains.
/// - `X-Forwarded-Proto` is set to `"http"` if absent; the gateway does
///   not terminate TLS, so inbound connections are always cleartext.
pub fn apply_forwarding(headers: &mut HeaderMap, client_ip: IpAddr) {
    let ip = client_ip.to_string();

    if let Ok(val) = HeaderValue::from_str(&ip) {
        headers.insert("x-real-ip", val);
    }

    let xff = headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {ip}"))
        .unwrap_or(ip);
    if let Ok(val) = HeaderValue::from_str(&xff) {
        headers.insert("x-forwarded-for", val);
    }

    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }
}

/// Rewrites the `Host` header to the upstream authority so virtual
/// hosting and TLS SNI resolve against the upstream, not the gateway.
pub fn rewrite_host(headers: &mut HeaderMap, upstream_auth: &Authority) {
    if let Ok(val) = HeaderValue::from_str(upstream_auth.as_str()) {
        headers.insert(hyper::header::HOST, val);
    }
}
