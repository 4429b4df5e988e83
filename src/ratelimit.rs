//! Sliding-window admission control with progressive blocking.
//!
//! The window is approximated by a single counter per admission key plus the
//! timestamp of the first request in the window; the counter is reset lazily
//! once the window has elapsed. Keys that keep exceeding their quota can be
//! blocked outright for an escalating duration.
//!
//! If the backing store is unreachable the limiter fails open: the request
//! is admitted and the outage is logged at error severity.

use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::store::{now_millis, CounterStore};

/// How the admission key for a request is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client IP address (honoring forwarded headers when trusted).
    #[default]
    ByIp,
    /// Presented credential, falling back to `"anonymous"`.
    ByUser,
    /// Client IP combined with the request path.
    ByIpAndEndpoint,
    /// `X-API-Key` header value, falling back to `"anonymous"`.
    ByApiKey,
}

/// Per-route admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Maximum requests admitted per key per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Upper bound on a progressive block, in milliseconds.
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,
    /// Whether persistent over-quota keys get blocked outright.
    #[serde(default)]
    pub progressive_delay: bool,
    /// Admission key derivation.
    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u64 {
    100
}

fn default_block_duration_ms() -> u64 {
    600_000
}

/// Escalation step for progressive blocking: one minute per request over quota.
const BLOCK_STEP_MS: u64 = 60_000;

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            block_duration_ms: default_block_duration_ms(),
            progressive_delay: false,
            key_strategy: KeyStrategy::ByIp,
        }
    }
}

impl LimitPolicy {
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            ..Default::default()
        }
    }

    pub fn with_progressive_delay(mut self, enabled: bool) -> Self {
        self.progressive_delay = enabled;
        self
    }

    pub fn with_block_duration_ms(mut self, ms: u64) -> Self {
        self.block_duration_ms = ms;
        self
    }

    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request must be rejected.
    pub limited: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Configured per-window maximum.
    pub limit: u64,
    /// When the current window (or block) ends.
    pub reset_at: DateTime<Utc>,
    /// Suggested wait before retrying, present when limited.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// `Retry-After` header value in whole seconds, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after
            .map(|d| d.as_secs().max(1))
            .unwrap_or(1)
    }
}

/// Sliding-window rate limiter over a pluggable counter store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Checks whether the request identified by `key` should be rejected,
    /// counting it against the window if admitted.
    pub async fn should_limit(&self, key: &str, policy: &LimitPolicy) -> RateLimitDecision {
        match self.store.is_blocked(key).await {
            Ok(Some(remaining)) => {
                debug!(key, remaining_ms = remaining.as_millis() as u64, "key is blocked");
                return Self::denied(policy, remaining);
            }
            Ok(None) => {}
            Err(e) => {
                error!(key, error = %e, "counter store unavailable, failing open");
                return Self::fail_open(policy);
            }
        }

        let entry = match self.store.increment(key, policy.window()).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(key, error = %e, "counter store unavailable, failing open");
                return Self::fail_open(policy);
            }
        };

        let now = now_millis();
        if now.saturating_sub(entry.first_request_at) >= policy.window_ms {
            // The window has elapsed: start a fresh one counting this request.
            if let Err(e) = self.store.reset(key).await {
                error!(key, error = %e, "counter store unavailable, failing open");
                return Self::fail_open(policy);
            }
            let fresh = match self.store.increment(key, policy.window()).await {
                Ok(entry) => entry,
                Err(e) => {
                    error!(key, error = %e, "counter store unavailable, failing open");
                    return Self::fail_open(policy);
                }
            };
            return Self::admitted(policy, &fresh);
        }

        if entry.count > policy.max_requests {
            if policy.progressive_delay && entry.count > 2 * policy.max_requests {
                let over = entry.count - policy.max_requests;
                let block_ms = (over * BLOCK_STEP_MS).min(policy.block_duration_ms);
                let block = Duration::from_millis(block_ms);
                if let Err(e) = self.store.block(key, block).await {
                    warn!(key, error = %e, "failed to record progressive block");
                }
                debug!(key, count = entry.count, block_ms, "progressive block applied");
                return Self::denied(policy, block);
            }

            let window_remaining = policy
                .window_ms
                .saturating_sub(now.saturating_sub(entry.first_request_at))
                .max(1_000);
            return Self::denied(policy, Duration::from_millis(window_remaining));
        }

        Self::admitted(policy, &entry)
    }

    fn admitted(policy: &LimitPolicy, entry: &crate::store::CounterEntry) -> RateLimitDecision {
        RateLimitDecision {
            limited: false,
            remaining: policy.max_requests.saturating_sub(entry.count),
            limit: policy.max_requests,
            reset_at: to_datetime(entry.first_request_at + policy.window_ms),
            retry_after: None,
        }
    }

    fn denied(policy: &LimitPolicy, retry_after: Duration) -> RateLimitDecision {
        RateLimitDecision {
            limited: true,
            remaining: 0,
            limit: policy.max_requests,
            reset_at: to_datetime(now_millis() + retry_after.as_millis() as u64),
            retry_after: Some(retry_after),
        }
    }

    fn fail_open(policy: &LimitPolicy) -> RateLimitDecision {
        RateLimitDecision {
            limited: false,
            remaining: policy.max_requests,
            limit: policy.max_requests,
            reset_at: to_datetime(now_millis() + policy.window_ms),
            retry_after: None,
        }
    }
}

fn to_datetime(epoch_ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(epoch_ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Derives admission keys from request attributes.
///
/// Every strategy degrades to a fixed sentinel when its signal is absent;
/// key derivation never fails a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyExtractor {
    /// Whether forwarded-for headers from upstream proxies are trusted.
    pub trust_forwarded_for: bool,
}

impl KeyExtractor {
    pub fn new(trust_forwarded_for: bool) -> Self {
        Self { trust_forwarded_for }
    }

    /// Builds the admission key for a request.
    pub fn admission_key(
        &self,
        strategy: KeyStrategy,
        headers: &HeaderMap,
        socket_ip: Option<IpAddr>,
        path: &str,
    ) -> String {
        match strategy {
            KeyStrategy::ByIp => self.client_ip_key(headers, socket_ip),
            KeyStrategy::ByUser => bearer_token(headers)
                .map(str::to_string)
                .unwrap_or_else(|| "anonymous".to_string()),
            KeyStrategy::ByIpAndEndpoint => {
                format!("{}:{}", self.client_ip_key(headers, socket_ip), path)
            }
            KeyStrategy::ByApiKey => headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| "anonymous".to_string()),
        }
    }

    fn client_ip_key(&self, headers: &HeaderMap, socket_ip: Option<IpAddr>) -> String {
        self.client_ip(headers, socket_ip)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Resolves the client IP, preferring forwarded headers when trusted.
    pub fn client_ip(&self, headers: &HeaderMap, socket_ip: Option<IpAddr>) -> Option<IpAddr> {
        if self.trust_forwarded_for {
            // X-Forwarded-For holds "client, proxy1, proxy2"; the first
            // entry is the original client.
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|s| IpAddr::from_str(s.trim()).ok());
            if let Some(ip) = forwarded {
                return Some(ip);
            }

            let real_ip = headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| IpAddr::from_str(s.trim()).ok());
            if let Some(ip) = real_ip {
                return Some(ip);
            }

            if headers.contains_key("x-forwarded-for") || headers.contains_key("x-real-ip") {
                warn!("unparseable forwarded-for headers, falling back to socket address");
            }
        }

        socket_ip
    }
}

/// Extracts the bearer token from an Authorization header, if any.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}
