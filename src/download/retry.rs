//! Retry logic with exponential backoff for transient HTTP failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying request errors and determining retry behavior.
//!
//! # Overview
//!
//! When a request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::RateLimited`] - Server rate limiting (retries, honoring Retry-After)
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays.
//!
//! # Example
//!
//! ```
//! use ipsw_downloader_core::download::{
//!     DownloadError, RetryPolicy, RetryDecision, classify_error
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://api.ipsw.me/v4/devices", 503);
//! let failure_type = classify_error(&error, policy.retry_statuses());
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;

/// Default maximum attempts, including the initial request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Status codes retried by default.
pub const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (2 minutes).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of request failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, connection refused, 500/502/503/504.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, malformed JSON body.
    Permanent,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the request.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `base_delay`: 1 second
/// - `max_delay`: 120 seconds
/// - `backoff_multiplier`: 2.0
/// - `max_jitter`: none
/// - `retry_statuses`: 429, 500, 502, 503, 504
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults, delays are 1s, 2s, 4s, 8s before the fifth attempt fails.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Upper bound of the random jitter added to each delay.
    max_jitter: Duration,

    /// HTTP statuses treated as retryable.
    retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: Duration::ZERO,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom backoff settings and the default status set.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the set of HTTP statuses treated as retryable.
    #[must_use]
    pub fn with_retry_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retry_statuses = statuses.into();
        self
    }

    /// Sets the upper bound of random jitter added to each backoff delay.
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the HTTP statuses treated as retryable.
    #[must_use]
    pub fn retry_statuses(&self) -> &[u16] {
        &self.retry_statuses
    }

    /// Determines whether to retry a failed request.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt 1 = multiplier^0 = 1x base
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Classifies a request error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | HTTP 429 (when in `retry_statuses`) | RateLimited |
/// | Other HTTP status in `retry_statuses` | Transient |
/// | Any other HTTP status | Permanent |
/// | Timeout | Transient |
/// | Network (most) | Transient |
/// | Network (TLS) | Permanent |
/// | IO, InvalidUrl, Decode, Integrity | Permanent |
pub fn classify_error(error: &DownloadError, retry_statuses: &[u16]) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => {
            if !retry_statuses.contains(status) {
                FailureType::Permanent
            } else if *status == 429 {
                FailureType::RateLimited
            } else {
                FailureType::Transient
            }
        }

        DownloadError::Timeout { .. } => FailureType::Transient,

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::Decode { .. }
        | DownloadError::Integrity { .. } => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Parses a Retry-After header value into a delay.
///
/// Accepts integer seconds or an HTTP-date. Values beyond [`MAX_RETRY_AFTER`]
/// are capped; dates in the past yield a zero delay.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => Some(MAX_RETRY_AFTER),
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn statuses() -> Vec<u16> {
        DEFAULT_RETRY_STATUSES.to_vec()
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(120));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
        assert_eq!(policy.retry_statuses(), &[429, 500, 502, 503, 504]);
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_retry_policy_custom_statuses() {
        let policy = RetryPolicy::default().with_retry_statuses(vec![503]);
        assert_eq!(policy.retry_statuses(), &[503]);
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_calculation_respects_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        // 6th attempt would be 1 * 2^5 = 32s, but capped at 5s
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::default().with_max_jitter(Duration::from_millis(200));
        for _ in 0..100 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    // ==================== Error Classification Tests ====================

    #[test]
    fn test_classify_retry_statuses_transient() {
        for status in [500, 502, 503, 504] {
            let error = DownloadError::http_status("http://example.com", status);
            assert_eq!(
                classify_error(&error, &statuses()),
                FailureType::Transient,
                "status {status}"
            );
        }
    }

    #[test]
    fn test_classify_429_rate_limited() {
        let error = DownloadError::http_status("http://example.com", 429);
        assert_eq!(classify_error(&error, &statuses()), FailureType::RateLimited);
    }

    #[test]
    fn test_classify_other_statuses_permanent() {
        for status in [400, 401, 403, 404, 410, 501] {
            let error = DownloadError::http_status("http://example.com", status);
            assert_eq!(
                classify_error(&error, &statuses()),
                FailureType::Permanent,
                "status {status}"
            );
        }
    }

    #[test]
    fn test_classify_respects_configured_status_set() {
        let error = DownloadError::http_status("http://example.com", 500);
        assert_eq!(classify_error(&error, &[503]), FailureType::Permanent);
    }

    #[test]
    fn test_classify_timeout_transient() {
        let error = DownloadError::timeout("http://example.com");
        assert_eq!(classify_error(&error, &statuses()), FailureType::Transient);
    }

    #[test]
    fn test_classify_decode_permanent() {
        let source = serde_json::from_str::<serde_json::Value>("[").unwrap_err();
        let error = DownloadError::decode("http://example.com", source);
        assert_eq!(classify_error(&error, &statuses()), FailureType::Permanent);
    }

    #[test]
    fn test_classify_io_error_permanent() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = DownloadError::io("/path/to/file", io_err);
        assert_eq!(classify_error(&error, &statuses()), FailureType::Permanent);
    }

    // ==================== Should Retry Decision Tests ====================

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("permanent")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_should_retry_rate_limited_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::RateLimited, 1);
        assert!(matches!(decision, RetryDecision::Retry { attempt: 2, .. }));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);

        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2),
            RetryDecision::Retry { .. }
        ));
        match policy.should_retry(FailureType::Transient, 3) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    // ==================== Retry-After Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative_ignored() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_capped() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_http_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
    }
}
