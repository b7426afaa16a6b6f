//! Streaming gzip response compression.
//!
//! When the client's `Accept-Encoding` lists the `gzip` token, the
//! response body is fed frame by frame through a [`flate2`] encoder and
//! re-emitted compressed. The encoder is finished at end-of-stream so the
//! gzip trailer always reaches the client. `Content-Length` is dropped
//! because it no longer describes the wire bytes.

use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::BodyExt;
use hyper::Response;
use hyper::body::{Body, Frame};
use hyper::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HeaderMap, HeaderValue};

use crate::{BoxBody, BoxError};

/// Returns `true` if the request opted in to gzip via `Accept-Encoding`.
/// Quality parameters are tolerated (`gzip;q=0.8`); matching is
/// case-insensitive per RFC 9110.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| token.split(';').next())
        .any(|encoding| encoding.trim().eq_ignore_ascii_case("gzip"))
}

/// Applies gzip encoding to the response.
///
/// A response that already carries a `Content-Encoding` is returned
/// unchanged; re-encoding an encoded body would corrupt it.
pub fn compress(resp: Response<BoxBody>) -> Response<BoxBody> {
    if resp.headers().contains_key(CONTENT_ENCODING) {
        return resp;
    }

    let (mut parts, body) = resp.into_parts();
    parts.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    parts.headers.remove(CONTENT_LENGTH);

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let body = GzipBody {
        inner: body,
        encoder: Some(encoder),
    }
    .boxed();

    Response::from_parts(parts, body)
}

/// Body adapter that compresses data frames as they stream through.
/// `encoder` is `None` once the stream has finished or failed.
struct GzipBody {
    inner: BoxBody,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl Body for GzipBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();

        loop {
            if this.encoder.is_none() {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        let Some(encoder) = this.encoder.as_mut() else {
                            return Poll::Ready(None);
                        };
                        if let Err(e) = encoder.write_all(&data) {
                            this.encoder = None;
                            return Poll::Ready(Some(Err(Box::new(e))));
                        }
                        let compressed = std::mem::take(encoder.get_mut());
                        if !compressed.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(Bytes::from(compressed)))));
                        }
                        // The encoder buffered everything; poll for more
                        // input.
                    }
                    // Trailers pass through uncompressed.
                    Err(other) => return Poll::Ready(Some(Ok(other))),
                },
                Poll::Ready(Some(Err(e))) => {
                    this.encoder = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    let Some(encoder) = this.encoder.take() else {
                        return Poll::Ready(None);
                    };
                    return match encoder.finish() {
                        Ok(remainder) => Poll::Ready(Some(Ok(Frame::data(Bytes::from(remainder))))),
                        Err(e) => Poll::Ready(Some(Err(Box::new(e)))),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.encoder.is_none()
    }
}
