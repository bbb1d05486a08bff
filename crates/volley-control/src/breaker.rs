//! Process-wide circuit breaker.
//!
//! A time-windowed gate: once tripped, it rejects outbound work until the
//! reset timeout elapses. The record pipeline reads it before every
//! submission; only the adaptive controller trips or clears it. The trip
//! record is mirrored to the durable store for cross-process visibility.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use volley_core::CircuitBreakerRecord;

struct Trip {
    at: Instant,
    at_wall: DateTime<Utc>,
    reason: String,
    metrics: Value,
}

/// Shared breaker state. Cheap to clone behind an `Arc`.
pub struct CircuitBreaker {
    reset_timeout: Duration,
    trip: Mutex<Option<Trip>>,
}

impl CircuitBreaker {
    pub fn new(reset_timeout: Duration) -> Self {
        Self {
            reset_timeout,
            trip: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Trip>> {
        self.trip.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Trips the breaker and returns the record to mirror durably.
    pub fn trip(&self, reason: impl Into<String>, metrics: Value) -> CircuitBreakerRecord {
        let reason = reason.into();
        let record = CircuitBreakerRecord {
            last_tripped: Utc::now(),
            reason: reason.clone(),
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
            metrics: metrics.clone(),
        };
        *self.lock() = Some(Trip {
            at: Instant::now(),
            at_wall: record.last_tripped,
            reason,
            metrics,
        });
        record
    }

    /// True while tripped and inside the reset window. Gates all outbound
    /// submissions.
    pub fn is_open(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|trip| trip.at.elapsed() < self.reset_timeout)
            .unwrap_or(false)
    }

    /// True once a trip has outlived the reset window and awaits recovery.
    pub fn has_elapsed(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|trip| trip.at.elapsed() >= self.reset_timeout)
            .unwrap_or(false)
    }

    /// Clears the trip; returns false when the breaker was not tripped.
    pub fn clear(&self) -> bool {
        self.lock().take().is_some()
    }

    pub fn record(&self) -> Option<CircuitBreakerRecord> {
        self.lock().as_ref().map(|trip| CircuitBreakerRecord {
            last_tripped: trip.at_wall,
            reason: trip.reason.clone(),
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
            metrics: trip.metrics.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn trip_opens_until_reset_timeout() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert!(!breaker.is_open());

        breaker.trip("error rate over threshold", json!({"avgError": 0.4}));
        assert!(breaker.is_open());
        assert!(!breaker.has_elapsed());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!breaker.is_open());
        assert!(breaker.has_elapsed());

        assert!(breaker.clear());
        assert!(!breaker.has_elapsed());
        assert!(!breaker.clear());
    }

    #[tokio::test]
    async fn record_mirrors_trip_metadata() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert!(breaker.record().is_none());
        breaker.trip("system health collapsed", json!({"systemHealth": -0.8}));
        let record = breaker.record().expect("tripped");
        assert_eq!(record.reason, "system health collapsed");
        assert_eq!(record.reset_timeout_ms, 60_000);
    }
}
