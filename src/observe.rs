//! Request identity and access logging.
//!
//! Each request is assigned a correlation id — the client-supplied
//! `X-Request-ID` when present, otherwise a fresh UUIDv4 — carried on a
//! [`RequestContext`] and echoed on the response. The id, method, path,
//! and client address live as fields on a per-request [`tracing::Span`];
//! every event emitted inside the pipeline inherits them instead of
//! repeating them. Access logging emits exactly two events per request:
//! `request_started` at ingress and `request_completed` once the response
//! body has been fully streamed or abandoned, with severity derived from
//! the final status.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use tracing::{Span, debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::headers::X_REQUEST_ID;
use crate::{BoxBody, BoxError};

/// Per-request carrier created at ingress and threaded through every
/// stage, retry attempt, and log event.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id echoed on the response and forwarded upstream.
    pub id: String,
    /// Wall-clock start of request processing.
    pub start: Instant,
    /// Deadline for buffering the inbound request body.
    pub read_deadline: tokio::time::Instant,
    /// Deadline for admission waits, backoff sleeps, and upstream
    /// attempts.
    pub deadline: tokio::time::Instant,
}

impl RequestContext {
    /// Adopts the inbound `X-Request-ID` if non-empty, otherwise
    /// generates a fresh UUIDv4. Client-supplied ids are not validated
    /// beyond non-emptiness. Deadlines derive from the server's read and
    /// write timeouts.
    pub fn new(headers: &HeaderMap, server: &ServerConfig) -> Self {
        let id = headers
            .get(X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let now = tokio::time::Instant::now();
        Self {
            id,
            start: Instant::now(),
            read_deadline: now + server.read_timeout,
            deadline: now + server.write_timeout,
        }
    }
}

/// Emits the `request_started` event. Identity fields come from the
/// enclosing request span.
pub fn log_started(headers: &HeaderMap) {
    let user_agent = headers
        .get(hyper::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    info!(user_agent, "request_started");
}

/// Echoes the correlation id on the response.
pub fn echo_request_id(resp: &mut Response<BoxBody>, ctx: &RequestContext) {
    if let Ok(value) = HeaderValue::from_str(&ctx.id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }
}

/// Wraps the response body so `request_completed` fires with the final
/// status and the byte count actually streamed, rather than whatever the
/// inner handler reported. The body outlives the pipeline future, so the
/// request span travels with it and is re-entered at emission time.
pub fn finalize(resp: Response<BoxBody>, ctx: &RequestContext, span: Span) -> Response<BoxBody> {
    let log = CompletionLog {
        span,
        status: resp.status(),
        start: ctx.start,
        bytes: 0,
        emitted: false,
    };

    resp.map(|body| AccessLogBody { inner: body, log }.boxed())
}

#[derive(Debug)]
struct CompletionLog {
    span: Span,
    status: StatusCode,
    start: Instant,
    bytes: u64,
    emitted: bool,
}

impl CompletionLog {
    /// Emits `request_completed` exactly once, inside the request span.
    /// Severity follows the final status; 302 is demoted to DEBUG to
    /// suppress probe noise.
    fn emit(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let _entered = self.span.enter();
        let status = self.status.as_u16();
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let bytes = self.bytes;

        if self.status == StatusCode::FOUND {
            debug!(status, duration_ms, bytes, "request_completed");
        } else if status < 400 {
            info!(status, duration_ms, bytes, "request_completed");
        } else if status < 500 {
            warn!(status, duration_ms, bytes, "request_completed");
        } else {
            error!(status, duration_ms, bytes, "request_completed");
        }
    }
}

/// Body wrapper that counts streamed bytes and logs completion at
/// end-of-stream, or on drop if the client went away first.
struct AccessLogBody {
    inner: BoxBody,
    log: CompletionLog,
}

impl Body for AccessLogBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.log.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.log.emit();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.log.emit();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for AccessLogBody {
    fn drop(&mut self) {
        self.log.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn test_server_config() -> ServerConfig {
        crate::Config::default().server
    }

    fn context_for(pairs: &[(&str, &str)]) -> RequestContext {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestContext::new(&headers, &test_server_config())
    }

    #[test]
    fn adopts_client_supplied_id() {
        let ctx = context_for(&[("x-request-id", "trace-abc-123")]);
        assert_eq!(ctx.id, "trace-abc-123");
    }

    #[test]
    fn generates_uuid_when_absent() {
        let ctx = context_for(&[]);
        assert!(Uuid::parse_str(&ctx.id).is_ok());
    }

    #[test]
    fn blank_id_is_treated_as_absent() {
        let ctx = context_for(&[("x-request-id", "   ")]);
        assert!(Uuid::parse_str(&ctx.id).is_ok());
    }

    #[test]
    fn read_deadline_precedes_write_deadline() {
        let ctx = context_for(&[]);
        assert!(ctx.read_deadline < ctx.deadline);
    }

    #[test]
    fn echoes_id_on_response() {
        let ctx = context_for(&[("x-request-id", "echo-me")]);
        let mut resp = Response::new(crate::error::text_body("ok"));

        echo_request_id(&mut resp, &ctx);

        assert_eq!(resp.headers().get(X_REQUEST_ID).unwrap(), "echo-me");
    }

    #[tokio::test]
    async fn finalize_passes_body_through_unchanged() {
        let ctx = context_for(&[]);
        let body = Full::new(Bytes::from_static(b"payload"))
            .map_err(|never| -> BoxError { match never {} })
            .boxed();
        let resp = Response::new(body);

        let wrapped = finalize(resp, &ctx, Span::none());
        let collected = wrapped.into_body().collect().await.unwrap().to_bytes();

        assert_eq!(collected, Bytes::from_static(b"payload"));
    }
}
