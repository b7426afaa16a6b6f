//! Error types and HTTP status code mapping.

use std::fmt;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use crate::{BoxBody, BoxError};

/// Which rate limiter denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// The process-wide bucket, which reflects total offered load.
    Global,
    /// The per-client bucket keyed by IP address.
    PerIp,
}

impl LimitScope {
    /// Stable identifier used in log events and denial bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::PerIp => "per-ip",
        }
    }
}

/// Every failure the gateway can produce, each mapping to a specific
/// HTTP status and a fixed plain-text body.
#[derive(Debug)]
pub enum GatewayError {
    /// An environment variable could not be parsed at startup.
    Config(String),
    /// An upstream base URL is malformed or missing scheme/authority.
    InvalidUpstream(String),
    /// No route matched the request path.
    NotFound,
    /// The authentication predicate rejected the request.
    Unauthorized,
    /// The request was cancelled before a concurrency permit was granted.
    Cancelled,
    /// A rate limiter denied the request.
    RateLimited(LimitScope),
    /// The upstream was unreachable or retry attempts were exhausted.
    Upstream(String),
    /// An internal invariant failed.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidUpstream(msg) => write!(f, "invalid upstream: {msg}"),
            Self::NotFound => write!(f, "no matching route"),
            Self::Unauthorized => write!(f, "authentication rejected"),
            Self::Cancelled => write!(f, "request cancelled before admission"),
            Self::RateLimited(scope) => write!(f, "rate limit exceeded ({})", scope.as_str()),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidUpstream(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Converts this error into the client-facing response. Bodies are
    /// fixed plain-text strings; rate-limit denials carry `Retry-After: 1`.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();

        let mut builder = Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8");
        if let Self::RateLimited(_) = self {
            builder = builder.header(hyper::header::RETRY_AFTER, "1");
        }

        let body = match self {
            Self::Config(_) | Self::InvalidUpstream(_) | Self::Internal(_) => {
                "internal server error"
            }
            Self::NotFound => "not found",
            Self::Unauthorized => "unauthorized",
            Self::Cancelled => "request cancelled",
            Self::RateLimited(LimitScope::Global) => "rate limit exceeded (global)",
            Self::RateLimited(LimitScope::PerIp) => "rate limit exceeded (per-ip)",
            Self::Upstream(_) => "bad gateway",
        };

        builder.body(text_body(body)).unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(text_body("internal server error"))
                .expect("building fallback response must not fail")
        })
    }
}

/// Builds a static plain-text response body.
pub(crate) fn text_body(text: &'static str) -> BoxBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}
