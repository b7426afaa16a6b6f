//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends bound to port 0, gateway state
//! builders, request constructors, and body helpers used across the
//! integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use portcullis::{
    BoxBody, BoxError, Config, GatewayState, ReverseProxy, RetryPolicy, Router, UpstreamTarget,
    build_client,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn full_body(text: &'static str) -> BoxBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn request(method: Method, path: &str) -> Request<BoxBody> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(empty_body())
        .unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`].
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Decompresses a gzip body into a string.
pub fn gunzip(bytes: &[u8]) -> String {
    use std::io::Read;

    let mut out = String::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_string(&mut out)
        .expect("body must be valid gzip");
    out
}

/// Default test configuration with fast retry backoff.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.base_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(40);
    config
}

/// Builds gateway state routing `/api/auth` and `/api/onboarding` to the
/// given backend.
pub fn state_for(backend: SocketAddr, config: &Config) -> Arc<GatewayState> {
    let router = router_for(backend, config);
    Arc::new(GatewayState::new(config, router))
}

/// Builds gateway state from an explicit router, for auth-hook and panic
/// tests.
pub fn state_with_router(router: Router, config: &Config) -> Arc<GatewayState> {
    Arc::new(GatewayState::new(config, router))
}

/// Builds a router whose two API prefixes both target `backend`.
pub fn router_for(backend: SocketAddr, config: &Config) -> Router {
    let client = build_client();
    let retry = RetryPolicy::from_config(&config.retry);
    let target = |addr: SocketAddr| UpstreamTarget::parse(&format!("http://{addr}")).unwrap();

    Router::new(vec![
        (
            "/api/auth".to_owned(),
            ReverseProxy::new(target(backend), client.clone(), retry),
        ),
        (
            "/api/onboarding".to_owned(),
            ReverseProxy::new(target(backend), client, retry),
        ),
    ])
}

/// Returns an address nothing is listening on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind throwaway listener");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Starts a local HTTP server that answers every request with the given
/// status and body. Returns the address and a shutdown handle.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(status)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that fails with `fail_status` for the first
/// `failures` requests, then answers `200 recovered`. The counter records
/// the total number of requests received.
pub async fn start_flaky_backend(
    fail_status: StatusCode,
    failures: usize,
) -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let counter = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    let server_counter = Arc::clone(&counter);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let counter = Arc::clone(&server_counter);
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let counter = Arc::clone(&counter);
                        async move {
                            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            let (status, body) = if seen <= failures {
                                (fail_status, "failing")
                            } else {
                                (StatusCode::OK, "recovered")
                            };
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "text/plain")
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, counter, tx)
}

/// Starts a backend that echoes the request headers, sorted one per line,
/// as its response body. Used to verify director rewrites.
pub async fn start_echo_headers_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let mut lines = Vec::new();
                        for (name, value) in req.headers() {
                            if let Ok(v) = value.to_str() {
                                lines.push(format!("{}: {}", name.as_str(), v));
                            }
                        }
                        lines.sort();
                        let body = lines.join("\n");
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/plain")
                                .body(Full::new(Bytes::from(body)))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a backend that echoes the request body back verbatim.
pub async fn start_echo_body_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = req
                            .into_body()
                            .collect()
                            .await
                            .expect("failed to read request body")
                            .to_bytes();
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "application/octet-stream")
                                .body(Full::new(body))
                                .expect("test response must build"),
                        )
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
