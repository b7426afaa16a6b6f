//! Environment-driven configuration, read once at startup.
//!
//! The gateway takes its entire tunable surface from environment variables
//! with defaults; an unparseable value is fatal. Loading goes through an
//! injectable lookup closure so tests can supply values without mutating
//! the process environment. Server timeouts are fixed constants rather
//! than tunables.

use std::time::Duration;

use crate::{GatewayError, Result};

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen port.
    pub port: u16,
    /// Bound on reading the request line and headers.
    pub read_header_timeout: Duration,
    /// Bound on buffering the inbound request body.
    pub read_timeout: Duration,
    /// Per-request budget covering admission waits, backoff sleeps, and
    /// upstream attempts.
    pub write_timeout: Duration,
    /// Cap on a connection's total lifetime, standing in for a
    /// keep-alive idle bound.
    pub idle_timeout: Duration,
}

/// Upstream service base URLs, one per routed prefix.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Target for `/api/auth` traffic.
    pub auth_url: String,
    /// Target for `/api/onboarding` traffic.
    pub onboarding_url: String,
}

/// In-flight concurrency cap.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Semaphore capacity; lower-bounded at 1 when applied.
    pub max_in_flight: usize,
}

/// Token-bucket rate limiting settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_ip_rps: f64,
    pub per_ip_burst: f64,
    pub global_rps: f64,
    pub global_burst: f64,
}

/// Retry behaviour for upstream round-trips. `attempts` counts total
/// tries including the first.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// Severity filter and serialization format for the log sink.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

/// Immutable snapshot of all gateway tunables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub throttle: ThrottleConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Idle window after which a per-client limiter entry is evicted.
    pub limiter_ttl: Duration,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None).expect("default configuration must be valid")
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through the given lookup, falling back to the
    /// documented defaults for absent keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        Ok(Self {
            server: ServerConfig {
                port: parse_field("PORT", &get("PORT", "80"))?,
                read_header_timeout: Duration::from_secs(10),
                read_timeout: Duration::from_secs(30),
                write_timeout: Duration::from_secs(60),
                idle_timeout: Duration::from_secs(120),
            },
            upstream: UpstreamConfig {
                auth_url: get("AUTH_SERVICE_URL", "https://auth.example.com"),
                onboarding_url: get("ONBOARDING_SERVICE_URL", "https://onboarding.example.com"),
            },
            throttle: ThrottleConfig {
                max_in_flight: parse_field("MAX_IN_FLIGHT", &get("MAX_IN_FLIGHT", "256"))?,
            },
            rate_limit: RateLimitConfig {
                per_ip_rps: parse_field("PER_IP_RPS", &get("PER_IP_RPS", "10"))?,
                per_ip_burst: parse_field("PER_IP_BURST", &get("PER_IP_BURST", "20"))?,
                global_rps: parse_field("GLOBAL_RPS", &get("GLOBAL_RPS", "200"))?,
                global_burst: parse_field("GLOBAL_BURST", &get("GLOBAL_BURST", "400"))?,
            },
            retry: RetryConfig {
                attempts: parse_field("RETRY_ATTEMPTS", &get("RETRY_ATTEMPTS", "3"))?,
                base_backoff: duration_field("RETRY_BACKOFF", &get("RETRY_BACKOFF", "150ms"))?,
                max_backoff: duration_field(
                    "RETRY_MAX_BACKOFF",
                    &get("RETRY_MAX_BACKOFF", "1500ms"),
                )?,
            },
            limiter_ttl: duration_field("LIMITER_TTL", &get("LIMITER_TTL", "10m"))?,
            logging: LoggingConfig {
                level: get("LOG_LEVEL", "info").to_ascii_lowercase(),
                format: get("LOG_FORMAT", "json").to_ascii_lowercase(),
            },
        })
    }
}

fn parse_field<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| GatewayError::Config(format!("invalid {key}={raw:?}: {e}")))
}

fn duration_field(key: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw).map_err(|e| GatewayError::Config(format!("invalid {key}={raw:?}: {e}")))
}

/// Parses a suffixed duration literal: `150ms`, `2s`, `10m`, `1h`.
/// Fractional values are accepted (`1.5s`).
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("duration {raw:?} is missing a unit"))?;
    let (value, unit) = raw.split_at(split);

    let value: f64 = value
        .parse()
        .map_err(|_| format!("duration {raw:?} has a non-numeric value"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("duration {raw:?} must be non-negative"));
    }

    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?}")),
    };

    Ok(Duration::from_secs_f64(seconds))
}
