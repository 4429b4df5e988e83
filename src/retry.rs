//! Retry policy with per-attempt timeout scaling and exponential backoff.
//!
//! Attempts are numbered from 1. Each attempt's timeout grows by a fixed
//! factor so slow-but-alive backends get progressively more room; the delay
//! between attempts doubles, with additive jitter to avoid thundering herds.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Configuration for upstream retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (not a retry count).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Per-attempt timeout growth factor.
    pub timeout_scale: f64,
    /// Upper bound on the additive random jitter.
    pub jitter_cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            timeout_scale: 1.5,
            jitter_cap: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter; delays become deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_cap = Duration::ZERO;
        self
    }

    /// Timeout for the given 1-indexed attempt: `base × scale^(attempt−1)`.
    pub fn timeout_for(&self, attempt: u32, base: Duration) -> Duration {
        let factor = self.timeout_scale.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }

    /// Backoff delay after the given 1-indexed attempt failed:
    /// `base_delay × 2^(attempt−1) + jitter`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = (self.base_delay.as_millis() as f64 * exp) as u64;
        delay_ms = delay_ms.min(self.max_delay.as_millis() as u64);

        let jitter_cap = self.jitter_cap.as_millis() as u64;
        if jitter_cap > 0 {
            delay_ms += rand::thread_rng().gen_range(0..=jitter_cap);
        }

        debug!(attempt, delay_ms, "scheduling retry");
        Duration::from_millis(delay_ms)
    }

    /// Whether a response status should count as a failed attempt.
    pub fn is_retryable_status(status: u16) -> bool {
        status >= 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.timeout_scale, 1.5);
    }

    #[test]
    fn test_timeout_scaling() {
        let config = RetryConfig::default();
        let base = Duration::from_millis(1_000);

        assert_eq!(config.timeout_for(1, base), Duration::from_millis(1_000));
        assert_eq!(config.timeout_for(2, base), Duration::from_millis(1_500));
        assert_eq!(config.timeout_for(3, base), Duration::from_millis(2_250));
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .without_jitter();

        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_by_max() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(2))
            .without_jitter();

        assert_eq!(config.delay_after(5), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let config = RetryConfig::new().with_base_delay(Duration::from_millis(100));

        for _ in 0..50 {
            let delay = config.delay_after(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_retryable_status() {
        assert!(RetryConfig::is_retryable_status(500));
        assert!(RetryConfig::is_retryable_status(503));
        assert!(!RetryConfig::is_retryable_status(404));
        assert!(!RetryConfig::is_retryable_status(200));
        assert!(!RetryConfig::is_retryable_status(429));
    }

    #[test]
    fn test_max_attempts_floor() {
        let config = RetryConfig::new().with_max_attempts(0);
        assert_eq!(config.max_attempts, 1);
    }
}
