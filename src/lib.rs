//! An HTTP API-gateway reverse proxy built on [hyper] and [tokio].
//!
//! This crate fronts a fixed set of upstream services, classifies inbound
//! requests by URL prefix, and forwards them over a pooled TLS-capable
//! client while enforcing protective policies: a bounded in-flight
//! concurrency gate, global and per-client token-bucket rate limits with
//! TTL eviction of idle clients, bounded retries with capped exponential
//! backoff for idempotent methods, hop-by-hop header hygiene, and gzip
//! response compression.
//!
//! Request processing is a fixed outer-to-inner pipeline: panic recovery,
//! request identity, access logging, response compression, the concurrency
//! gate, rate limiting (global then per-client), prefix routing, and
//! finally the reverse proxy itself. The ordering is part of the contract;
//! see [`server::handle`].
//!
//! Every request carries a correlation id (client-supplied `X-Request-ID`
//! or a fresh UUID) that is echoed on the response, forwarded upstream,
//! and present in every log event for that request, including retries.
//!
//! [hyper]: https://hyper.rs/
//! [tokio]: https://tokio.rs/

pub mod config;
pub mod error;
pub mod gzip;
pub mod headers;
pub mod limit;
pub mod observe;
pub mod proxy;
pub mod router;
pub mod server;

pub use config::Config;
pub use error::{GatewayError, LimitScope};
pub use limit::{PerKeyBuckets, TokenBucket};
pub use observe::RequestContext;
pub use proxy::{ReverseProxy, RetryPolicy, UpstreamClient, UpstreamTarget, build_client};
pub use router::{AuthPredicate, Router};
pub use server::{GatewayState, handle, serve, shutdown_signal};

/// Convenience alias for fallible gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Boxed error type carried by response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type flowing through every pipeline stage.
pub type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, BoxError>;
