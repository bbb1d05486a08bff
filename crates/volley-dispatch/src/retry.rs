//! Per-record retry policy.
//!
//! Decisions are made from the classified error only: user-action failures
//! never retry, non-retryable categories fail immediately, and rate limits
//! honor the server's `Retry-After` over the exponential backoff. The
//! policy must return `Fail` once attempts are exhausted or the retry loop
//! would not terminate.

use std::time::Duration;

use volley_core::ApiError;

/// Decision after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Retry tuning carried with each pool task.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Total attempt budget per record.
    pub max_attempts: u32,
    /// Base delay; actual delay = base × 2^attempt.
    pub backoff_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Decides what to do after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, error: &ApiError, attempt: u32) -> RetryDecision {
        if error.user_action_required || !error.can_retry {
            return RetryDecision::Fail;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Fail;
        }
        if let Some(ms) = error.retry_after_ms {
            return RetryDecision::RetryAfter(Duration::from_millis(ms));
        }
        let delay = self.backoff_base * 2u32.saturating_pow(attempt);
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use volley_core::{classify_response, classify_transport, TransportCondition};

    fn rate_limited(retry_after: Option<&str>) -> ApiError {
        let mut headers = HashMap::new();
        if let Some(value) = retry_after {
            headers.insert("retry-after".to_string(), value.to_string());
        }
        classify_response(429, &headers, &serde_json::Value::Null)
    }

    #[test]
    fn user_action_never_retries() {
        let config = RetryConfig::default();
        let error = classify_response(422, &HashMap::new(), &serde_json::Value::Null);
        assert_eq!(config.decide(&error, 1), RetryDecision::Fail);
    }

    #[test]
    fn system_error_fails_immediately() {
        let config = RetryConfig::default();
        let error = classify_response(500, &HashMap::new(), &serde_json::Value::Null);
        assert_eq!(config.decide(&error, 1), RetryDecision::Fail);
    }

    #[test]
    fn network_error_backs_off_exponentially() {
        let config = RetryConfig::default();
        let error = classify_transport(TransportCondition::Timeout, "timed out");
        assert_eq!(
            config.decide(&error, 1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            config.decide(&error, 2),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(config.decide(&error, 3), RetryDecision::Fail);
    }

    #[test]
    fn retry_after_header_overrides_backoff() {
        let config = RetryConfig::default();
        assert_eq!(
            config.decide(&rate_limited(Some("2")), 1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        // Sub-second values floor at one second during classification.
        assert_eq!(
            config.decide(&rate_limited(Some("0")), 1),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        // Without the header, 429 falls back to the exponential schedule.
        assert_eq!(
            config.decide(&rate_limited(None), 2),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
    }
}
