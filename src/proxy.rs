//! Upstream forwarding: the director that rewrites outbound requests, the
//! pooled TLS-capable client, and the retrying transport.
//!
//! Retries are attempted only for idempotent methods. The inbound body is
//! buffered once per request so every attempt replays identical bytes. A
//! 5xx response that triggers a retry is fully drained before the next
//! attempt so its pooled connection is returned rather than leaked.
//! Backoff doubles per attempt, is capped, and aborts early when the
//! request deadline expires.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::http::uri::{Authority, Scheme};
use hyper::{Method, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::headers::{self, X_REQUEST_ID};
use crate::observe::RequestContext;
use crate::{BoxBody, BoxError, GatewayError, Result};

// Outbound transport policy. Upstreams are TLS-terminated cloud services;
// these bounds are part of the forwarding contract.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_PER_HOST: usize = 64;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(20);

/// The pooled client shared by all reverse proxies.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// A parsed upstream base URL plus the pieces needed to rewrite requests:
/// scheme, authority, and the bare hostname used for SNI.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    host: String,
}

impl UpstreamTarget {
    /// Parses an absolute base URL, requiring both scheme and authority.
    pub fn parse(raw: &str) -> Result<Self> {
        let uri: Uri = raw
            .parse()
            .map_err(|e| GatewayError::InvalidUpstream(format!("{raw}: {e}")))?;
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| GatewayError::InvalidUpstream(format!("{raw}: missing scheme")))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| GatewayError::InvalidUpstream(format!("{raw}: missing authority")))?;
        let host = authority.host().to_owned();

        Ok(Self {
            scheme,
            authority,
            host,
        })
    }

    /// Host and optional port, used for the rewritten `Host` header.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Bare hostname, which TLS SNI resolves against.
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Builds the shared upstream client: TLS 1.2 minimum over webpki roots,
/// ALPN for HTTP/2 and HTTP/1.1, 5 s dial timeout, 30 s TCP keepalive,
/// and a bounded idle pool (64 per host, 90 s idle timeout). SNI follows
/// the request URI host, which the director rewrites to the upstream.
pub fn build_client() -> UpstreamClient {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(DIAL_TIMEOUT));
    http.set_keepalive(Some(TCP_KEEPALIVE));

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_IDLE_PER_HOST)
        .build(https)
}

/// Retry bounds. `attempts` is the total number of tries including the
/// first; the delay before try `i+1` is `min(max, base * 2^i)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Builds the policy from configuration, substituting sane bounds for
    /// degenerate values.
    pub fn from_config(retry: &RetryConfig) -> Self {
        Self {
            attempts: retry.attempts.max(1),
            base_backoff: if retry.base_backoff.is_zero() {
                Duration::from_millis(100)
            } else {
                retry.base_backoff
            },
            max_backoff: if retry.max_backoff.is_zero() {
                Duration::from_secs(2)
            } else {
                retry.max_backoff
            },
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

/// Methods whose repeated application has the same effect as a single
/// application, and are therefore safe to retry.
fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::OPTIONS
        || *method == Method::PUT
        || *method == Method::DELETE
}

/// Forwards requests for one upstream: rewrites them via the director and
/// round-trips them through the retrying transport.
pub struct ReverseProxy {
    target: UpstreamTarget,
    client: UpstreamClient,
    retry: RetryPolicy,
}

impl ReverseProxy {
    pub fn new(target: UpstreamTarget, client: UpstreamClient, retry: RetryPolicy) -> Self {
        Self {
            target,
            client,
            retry,
        }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Forwards the request to the upstream, retrying transport failures
    /// and 5xx responses for idempotent methods.
    ///
    /// The inbound body is buffered before the first attempt so retries
    /// replay identical bytes. The final outcome is either the upstream
    /// response (including a final 5xx, forwarded as-is) or
    /// [`GatewayError::Upstream`], surfaced to the client as `502`.
    pub async fn forward(
        &self,
        req: Request<BoxBody>,
        ctx: &RequestContext,
        client_ip: IpAddr,
    ) -> Result<Response<BoxBody>> {
        let (parts, body) = req.into_parts();
        // Buffering the body is where the full request is read; the
        // server's read timeout bounds it.
        let read_deadline = ctx.read_deadline.min(ctx.deadline);
        let body = match tokio::time::timeout_at(read_deadline, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                return Err(GatewayError::Upstream(format!(
                    "failed to read request body: {e}"
                )));
            }
            Err(_elapsed) => return Err(GatewayError::Cancelled),
        };

        let method = parts.method.clone();
        let (uri, outbound_headers) = self.direct(&parts.uri, &parts.headers, ctx, client_ip)?;

        let can_retry = is_idempotent(&method);
        let attempts = self.retry.attempts.max(1);
        let upstream = self.target.authority.as_str();
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let try_req = attempt_request(&method, &uri, &outbound_headers, &body)?;
            let attempt_deadline = ctx
                .deadline
                .min(tokio::time::Instant::now() + RESPONSE_HEADER_TIMEOUT);

            let error = match tokio::time::timeout_at(attempt_deadline, self.client.request(try_req))
                .await
            {
                Ok(Ok(resp)) => {
                    if resp.status().is_server_error() && can_retry && attempt + 1 < attempts {
                        warn!(
                            upstream,
                            status = resp.status().as_u16(),
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            "proxy_retry_5xx"
                        );
                        // Return the connection to the pool before the
                        // next attempt.
                        let _ = resp.into_body().collect().await;
                        if !self.backoff(attempt, ctx).await {
                            break;
                        }
                        continue;
                    }
                    let resp =
                        resp.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed());
                    return Ok(resp);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_elapsed) => {
                    format!("no response headers within {RESPONSE_HEADER_TIMEOUT:?}")
                }
            };

            last_error = Some(error.clone());
            if !can_retry || attempt + 1 == attempts {
                break;
            }
            warn!(
                upstream,
                attempt = attempt + 1,
                max_attempts = attempts,
                error = %error,
                "proxy_retry"
            );
            if !self.backoff(attempt, ctx).await {
                break;
            }
        }

        let error = last_error.unwrap_or_else(|| "retry attempts exhausted".to_owned());
        error!(upstream, error = %error, "proxy_error");
        Err(GatewayError::Upstream(error))
    }

    /// The director: rebuilds the request line and headers for the
    /// upstream. Scheme and authority come from the target; the path and
    /// query are preserved. `Host` is rewritten so SNI and virtual
    /// hosting resolve against the upstream, hop-by-hop headers are
    /// stripped, forwarding headers are injected, and the correlation id
    /// travels with the request.
    fn direct(
        &self,
        inbound_uri: &Uri,
        inbound_headers: &HeaderMap,
        ctx: &RequestContext,
        client_ip: IpAddr,
    ) -> Result<(Uri, HeaderMap)> {
        let path_and_query = inbound_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let uri = Uri::builder()
            .scheme(self.target.scheme.clone())
            .authority(self.target.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build upstream URI: {e}")))?;

        let mut headers = inbound_headers.clone();
        headers::strip_hop_by_hop(&mut headers);
        headers::apply_forwarding(&mut headers, client_ip);
        headers::rewrite_host(&mut headers, &self.target.authority);
        if let Ok(id) = HeaderValue::from_str(&ctx.id) {
            headers.insert(X_REQUEST_ID, id);
        }

        Ok((uri, headers))
    }

    /// Sleeps for the capped exponential delay before the next attempt.
    /// Returns `false` if the request deadline expired during the wait,
    /// in which case the retry loop must abort.
    async fn backoff(&self, attempt: u32, ctx: &RequestContext) -> bool {
        let delay = self.retry.delay(attempt);
        tokio::time::timeout_at(ctx.deadline, tokio::time::sleep(delay))
            .await
            .is_ok()
    }
}

fn attempt_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Request<Full<Bytes>>> {
    let mut req = Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .body(Full::new(body.clone()))
        .map_err(|e| GatewayError::Internal(format!("failed to build upstream request: {e}")))?;
    *req.headers_mut() = headers.clone();
    Ok(req)
}
