//! Pipeline composition and the accept loop.
//!
//! [`handle`] wires the fixed outer-to-inner stage order: panic recovery,
//! request identity, access logging, response compression, the
//! concurrency gate, rate limiting, and the router. The ordering is part
//! of the gateway's contract — recovery is outermost and covers every
//! stage below it, compression applies to limiter denials, and the gate
//! is held across rate-limit evaluation and upstream dispatch.
//!
//! Every request runs inside a [`tracing::Span`] carrying the correlation
//! id, method, path, and client address, so events emitted anywhere in
//! the pipeline (retries included) share those fields without repeating
//! them.
//!
//! [`serve`] accepts connections and dispatches each on its own task;
//! this module is decoupled from `main()` so the server logic remains
//! testable without process-level concerns.

use std::any::Any;
use std::backtrace::Backtrace;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info, warn};

use crate::config::ServerConfig;
use crate::observe::RequestContext;
use crate::router::Router;
use crate::{
    BoxBody, BoxError, Config, GatewayError, PerKeyBuckets, Result, TokenBucket, gzip, headers,
    limit, observe,
};

/// Shared state for the request pipeline.
pub struct GatewayState {
    /// Prefix router over the configured upstream proxies.
    pub router: Router,
    /// Bounds the number of in-flight requests.
    pub semaphore: Arc<Semaphore>,
    /// Process-wide token bucket evaluated before the per-client bucket.
    pub global_limiter: Arc<TokenBucket>,
    /// Per-client buckets keyed by IP, swept in the background.
    pub per_ip_limiter: PerKeyBuckets,
    /// Server timeouts: header-read and connection bounds for the accept
    /// loop, read/write budgets for each request's deadlines.
    pub server: ServerConfig,
}

impl GatewayState {
    /// Builds the shared state from configuration and a wired router.
    pub fn new(config: &Config, router: Router) -> Self {
        Self {
            router,
            semaphore: Arc::new(Semaphore::new(config.throttle.max_in_flight.max(1))),
            global_limiter: Arc::new(TokenBucket::new(
                config.rate_limit.global_rps,
                config.rate_limit.global_burst,
            )),
            per_ip_limiter: PerKeyBuckets::new(
                config.rate_limit.per_ip_rps,
                config.rate_limit.per_ip_burst,
                config.limiter_ttl,
            ),
            server: config.server.clone(),
        }
    }
}

/// Processes one request through the full pipeline and always produces a
/// response; a panic in any stage below recovery surfaces as `500`.
pub async fn handle(
    req: Request<BoxBody>,
    state: Arc<GatewayState>,
    peer: SocketAddr,
) -> Response<BoxBody> {
    let span = tracing::info_span!(
        "request",
        id = tracing::field::Empty,
        method = %req.method(),
        path = %req.uri().path(),
        client = tracing::field::Empty,
    );

    async move {
        // Filled by the identity stage, so recovery can still echo the id
        // when a later stage panics.
        let identity = OnceLock::new();

        match AssertUnwindSafe(identified(req, &state, peer, &identity))
            .catch_unwind()
            .await
        {
            Ok(resp) => resp,
            Err(panic) => {
                error!(
                    panic = panic_message(panic.as_ref()),
                    stack = %Backtrace::force_capture(),
                    "panic_recovered"
                );
                let resp =
                    GatewayError::Internal("panic in request pipeline".into()).into_response();
                match identity.get() {
                    Some(ctx) => {
                        let mut resp = observe::finalize(resp, ctx, tracing::Span::current());
                        observe::echo_request_id(&mut resp, ctx);
                        resp
                    }
                    // The crash preceded identity resolution; there is no
                    // id to echo.
                    None => resp,
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Identity and access-logging stages: resolves the correlation id,
/// records it on the request span, emits `request_started`, and wraps the
/// response so `request_completed` observes the final status and byte
/// count. The resolved context is published through `identity` before any
/// deeper stage runs.
async fn identified(
    req: Request<BoxBody>,
    state: &Arc<GatewayState>,
    peer: SocketAddr,
    identity: &OnceLock<RequestContext>,
) -> Response<BoxBody> {
    let ctx = RequestContext::new(req.headers(), &state.server);
    let client_ip = headers::client_ip(req.headers(), peer);

    let span = tracing::Span::current();
    span.record("id", tracing::field::display(&ctx.id));
    span.record("client", tracing::field::display(client_ip));
    let _ = identity.set(ctx.clone());

    observe::log_started(req.headers());

    let resp = compressed(req, &ctx, state, client_ip).await;

    let mut resp = observe::finalize(resp, &ctx, span);
    observe::echo_request_id(&mut resp, &ctx);
    resp
}

/// Compression stage: converts stage errors into their terminal responses
/// and gzip-encodes the result when the client opted in. Denials from the
/// gate and the limiters are compressed like any other response.
async fn compressed(
    req: Request<BoxBody>,
    ctx: &RequestContext,
    state: &Arc<GatewayState>,
    client_ip: std::net::IpAddr,
) -> Response<BoxBody> {
    let wants_gzip = gzip::accepts_gzip(req.headers());

    let resp = admitted(req, ctx, state, client_ip)
        .await
        .unwrap_or_else(GatewayError::into_response);

    if wants_gzip {
        gzip::compress(resp)
    } else {
        resp
    }
}

/// Admission stages: the concurrency gate, then the rate limiters, then
/// dispatch. The permit rides the response body so it is released only
/// once the response has been fully streamed.
async fn admitted(
    req: Request<BoxBody>,
    ctx: &RequestContext,
    state: &Arc<GatewayState>,
    client_ip: std::net::IpAddr,
) -> Result<Response<BoxBody>> {
    let permit = limit::acquire(&state.semaphore, ctx.deadline).await?;

    limit::check_admission(&state.global_limiter, &state.per_ip_limiter, client_ip)?;

    let resp = state.router.dispatch(req, ctx, client_ip).await?;
    Ok(resp.map(|body| limit::PermitBody::wrap(body, permit)))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Accepts connections on `listener` and serves each on its own task
/// until `shutdown` resolves, then stops accepting. In-flight requests on
/// already-spawned tasks run to completion independently.
///
/// Each connection is bounded twice: hyper's header-read timeout covers
/// the request line and headers, and the configured idle timeout caps the
/// connection's total lifetime (hyper exposes no between-requests idle
/// timer, so the lifetime bound stands in for one).
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let header_read_timeout = state.server.read_header_timeout;
                    let connection_lifetime = state.server.idle_timeout;
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move {
                            let req = req.map(|body| {
                                body.map_err(|e| Box::new(e) as BoxError).boxed()
                            });
                            Ok::<_, Infallible>(handle(req, state, peer).await)
                        }
                    });

                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(header_read_timeout)
                        .serve_connection(TokioIo::new(stream), svc);

                    match tokio::time::timeout(connection_lifetime, conn).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(%e, "connection error"),
                        Err(_elapsed) => {
                            warn!(limit = ?connection_lifetime, "connection lifetime exceeded, closing");
                        }
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Resolves when the process is asked to stop: Ctrl+C on every platform,
/// or SIGTERM where Unix signals exist.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler registration failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(signal = "interrupt", "shutdown requested"),
        () = terminate => info!(signal = "terminate", "shutdown requested"),
    }
}
