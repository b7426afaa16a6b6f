//! Admission control: the in-flight concurrency gate and the token-bucket
//! rate limiters with TTL eviction of idle per-client entries.
//!
//! The gate is a counting semaphore whose permit rides the response body,
//! so release happens exactly once on every exit path, including client
//! disconnects and panics unwinding through the pipeline. The buckets are
//! deterministic given a clock: `allow` takes the admission instant so the
//! refill arithmetic is reproducible in tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::error::LimitScope;
use crate::{BoxBody, BoxError, GatewayError, Result};

/// Interval between sweeps of the per-client bucket map.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// A token bucket. Tokens accrue continuously at `rate` per second up to
/// `burst`; each admission consumes one token. Immediately after any
/// `allow` call, `tokens` lies in `[0, burst]`.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
    last_seen: Instant,
}

fn relock<'a, T>(
    guard: std::result::Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    // Bucket state is a few scalars written atomically under the lock;
    // a panic elsewhere cannot leave it half-updated.
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl TokenBucket {
    /// Creates a bucket starting at full burst. `rate` and `burst` are
    /// clamped to at least 1.
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = if rate <= 0.0 { 1.0 } else { rate };
        let burst = if burst < 1.0 { 1.0 } else { burst };
        let now = Instant::now();
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: now,
                last_seen: now,
            }),
        }
    }

    /// Attempts to admit one request at instant `now`: refill first, then
    /// deduct a single token if one is available.
    pub fn allow(&self, now: Instant) -> bool {
        let mut st = relock(self.state.lock());

        let elapsed = now.saturating_duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = self.burst.min(st.tokens + elapsed * self.rate);
            st.last = now;
        }
        st.last_seen = now;

        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Instant of the most recent admission attempt.
    pub fn last_seen(&self) -> Instant {
        relock(self.state.lock()).last_seen
    }
}

/// Per-client buckets keyed by IP string, created lazily on first
/// admission and evicted by [`spawn_sweeper`] after `ttl` of inactivity.
#[derive(Debug, Clone)]
pub struct PerKeyBuckets {
    inner: Arc<PerKeyInner>,
}

#[derive(Debug)]
struct PerKeyInner {
    rate: f64,
    burst: f64,
    ttl: Duration,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl PerKeyBuckets {
    pub fn new(rate: f64, burst: f64, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PerKeyInner {
                rate,
                burst,
                ttl,
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admits or denies one request for `key` at instant `now`.
    ///
    /// The map lock is released before the bucket lock is taken, so
    /// admission for one client never blocks on another client's bucket.
    pub fn allow(&self, key: &str, now: Instant) -> bool {
        self.bucket(key).allow(now)
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        let mut map = relock(self.inner.buckets.lock());
        map.entry(key.to_owned())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.inner.rate, self.inner.burst)))
            .clone()
    }

    /// Removes entries idle longer than the TTL, returning the evicted
    /// count. Bucket locks are taken under the map lock, in the same
    /// map-then-bucket order as admission, so the sweep cannot invert.
    /// A zero TTL disables eviction.
    pub fn sweep(&self, now: Instant) -> usize {
        if self.inner.ttl.is_zero() {
            return 0;
        }

        let mut map = relock(self.inner.buckets.lock());
        let before = map.len();
        map.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen()) <= self.inner.ttl);
        before - map.len()
    }

    /// Number of client keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        relock(self.inner.buckets.lock()).len()
    }
}

/// Spawns the background task that sweeps idle per-client buckets once
/// per [`SWEEP_PERIOD`], preventing unbounded memory growth under
/// high-cardinality traffic.
pub fn spawn_sweeper(buckets: PerKeyBuckets) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let evicted = buckets.sweep(Instant::now());
            if evicted > 0 {
                info!(evicted, remaining = buckets.tracked_keys(), "limiter_sweep");
            }
        }
    })
}

/// Waits for an in-flight permit, failing with [`GatewayError::Cancelled`]
/// if the request deadline expires first.
pub async fn acquire(
    semaphore: &Arc<Semaphore>,
    deadline: tokio::time::Instant,
) -> Result<OwnedSemaphorePermit> {
    match tokio::time::timeout_at(deadline, Arc::clone(semaphore).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_closed)) => Err(GatewayError::Internal("in-flight semaphore closed".into())),
        Err(_elapsed) => Err(GatewayError::Cancelled),
    }
}

/// Evaluates the global bucket, then the per-client bucket. Correlation
/// fields come from the enclosing request span.
///
/// A per-client denial does not refund the global token: the global
/// bucket reflects offered load, not admitted load.
pub fn check_admission(
    global: &TokenBucket,
    per_key: &PerKeyBuckets,
    client_ip: IpAddr,
) -> Result<()> {
    let now = Instant::now();

    if !global.allow(now) {
        warn!(
            client_ip = %client_ip,
            r#type = LimitScope::Global.as_str(),
            "rate_limit_exceeded"
        );
        return Err(GatewayError::RateLimited(LimitScope::Global));
    }

    if !per_key.allow(&client_ip.to_string(), now) {
        warn!(
            client_ip = %client_ip,
            r#type = LimitScope::PerIp.as_str(),
            "rate_limit_exceeded"
        );
        return Err(GatewayError::RateLimited(LimitScope::PerIp));
    }

    Ok(())
}

/// Response body wrapper that holds the concurrency permit until the
/// final byte has been streamed or the body is dropped.
pub struct PermitBody {
    inner: BoxBody,
    _permit: OwnedSemaphorePermit,
}

impl PermitBody {
    pub fn wrap(body: BoxBody, permit: OwnedSemaphorePermit) -> BoxBody {
        Self {
            inner: body,
            _permit: permit,
        }
        .boxed()
    }
}

impl Body for PermitBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
