//! Rolling API metrics windows.
//!
//! All windows live in memory and are overwritten to the durable store
//! periodically; the error-timestamp window is additionally unioned with the
//! shared durable list so the rate survives restarts and reflects other
//! hosts. Two error-rate views exist on purpose: [`MetricsAggregator::error_fraction`]
//! (errors per call, the controller and limiter signal) and
//! [`MetricsAggregator::api_error_rate`] (errors per minute over the window).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use volley_core::Result;
use volley_store::ContextStore;

const RESPONSE_TIME_WINDOW: usize = 20;
const MINUTE_WINDOW: usize = 60;
const ENDPOINT_SAMPLE_WINDOW: usize = 10;

static HEX_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9a-fA-F]{32}").unwrap_or_else(|e| panic!("hex id regex: {}", e)));
static NUMERIC_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+").unwrap_or_else(|e| panic!("numeric id regex: {}", e)));

/// One observed outbound call (any attempt, success or failure).
#[derive(Clone, Debug)]
pub struct CallSample {
    pub url: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub success: bool,
}

#[derive(Clone, Debug)]
struct MinuteBucket {
    minute: i64,
    success: u64,
    error: u64,
    total_duration_ms: u64,
}

#[derive(Clone, Debug, Default)]
struct EndpointWindow {
    samples: VecDeque<u64>,
    calls: u64,
    last_updated_ms: i64,
}

#[derive(Default)]
struct MetricsInner {
    response_times: VecDeque<u64>,
    status_counts: HashMap<u16, u64>,
    minutes: VecDeque<MinuteBucket>,
    endpoints: HashMap<String, EndpointWindow>,
    error_timestamps: VecDeque<i64>,
}

/// Rolling windows over outbound API behavior.
pub struct MetricsAggregator {
    inner: Mutex<MetricsInner>,
    store: Arc<ContextStore>,
    error_window: Duration,
}

impl MetricsAggregator {
    pub fn new(store: Arc<ContextStore>, error_window: Duration) -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
            store,
            error_window,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one call into every window. Errors also land on the shared
    /// durable timestamp list; that write is best effort.
    pub async fn observe(&self, sample: CallSample) {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.error_window.as_millis() as i64;
        {
            let mut inner = self.lock();
            inner.response_times.push_back(sample.duration_ms);
            if inner.response_times.len() > RESPONSE_TIME_WINDOW {
                inner.response_times.pop_front();
            }
            if let Some(status) = sample.status {
                *inner.status_counts.entry(status).or_insert(0) += 1;
            }

            let minute = now_ms / 60_000;
            let bucket_is_stale = inner
                .minutes
                .back()
                .map_or(true, |bucket| bucket.minute != minute);
            if bucket_is_stale {
                inner.minutes.push_back(MinuteBucket {
                    minute,
                    success: 0,
                    error: 0,
                    total_duration_ms: 0,
                });
                if inner.minutes.len() > MINUTE_WINDOW {
                    inner.minutes.pop_front();
                }
            }
            if let Some(bucket) = inner.minutes.back_mut() {
                if sample.success {
                    bucket.success += 1;
                } else {
                    bucket.error += 1;
                }
                bucket.total_duration_ms += sample.duration_ms;
            }

            let pattern = normalize_url_pattern(&sample.url);
            let endpoint = inner.endpoints.entry(pattern).or_default();
            endpoint.samples.push_back(sample.duration_ms);
            if endpoint.samples.len() > ENDPOINT_SAMPLE_WINDOW {
                endpoint.samples.pop_front();
            }
            endpoint.calls += 1;
            endpoint.last_updated_ms = now_ms;

            if !sample.success {
                inner.error_timestamps.push_back(now_ms);
                while inner
                    .error_timestamps
                    .front()
                    .is_some_and(|ts| *ts < now_ms - window_ms)
                {
                    inner.error_timestamps.pop_front();
                }
            }
        }
        if !sample.success {
            if let Err(e) = self.store.push_error_timestamp(now_ms).await {
                tracing::warn!(error = %e, "failed to publish error timestamp");
            }
        }
    }

    /// Mean of the last twenty response times, in milliseconds.
    pub fn avg_response_time(&self) -> f64 {
        let inner = self.lock();
        if inner.response_times.is_empty() {
            return 0.0;
        }
        inner.response_times.iter().sum::<u64>() as f64 / inner.response_times.len() as f64
    }

    pub fn status_code_counts(&self) -> HashMap<u16, u64> {
        self.lock().status_counts.clone()
    }

    pub fn calls_last_minute(&self) -> u64 {
        let minute = Utc::now().timestamp_millis() / 60_000;
        self.lock()
            .minutes
            .iter()
            .filter(|bucket| bucket.minute >= minute - 1)
            .map(|bucket| bucket.success + bucket.error)
            .sum()
    }

    /// Error fraction (errors / calls) over the last `minutes` buckets.
    pub fn error_fraction(&self, minutes: usize) -> f64 {
        let inner = self.lock();
        let mut success = 0u64;
        let mut error = 0u64;
        for bucket in inner.minutes.iter().rev().take(minutes) {
            success += bucket.success;
            error += bucket.error;
        }
        let total = success + error;
        if total == 0 {
            0.0
        } else {
            error as f64 / total as f64
        }
    }

    /// Errors per minute over the rolling window, unioned with the shared
    /// durable timestamp list (the canonical rate; bounded staleness from
    /// other hosts is accepted).
    pub async fn api_error_rate(&self) -> f64 {
        let now_ms = Utc::now().timestamp_millis();
        let since = now_ms - self.error_window.as_millis() as i64;
        let mut union: Vec<i64> = {
            let inner = self.lock();
            inner
                .error_timestamps
                .iter()
                .copied()
                .filter(|ts| *ts >= since)
                .collect()
        };
        match self.store.recent_error_timestamps(since).await {
            Ok(durable) => union.extend(durable),
            Err(e) => tracing::warn!(error = %e, "durable error timestamps unavailable"),
        }
        union.sort_unstable();
        union.dedup();
        let window_minutes = (self.error_window.as_secs_f64() / 60.0).max(1.0);
        union.len() as f64 / window_minutes
    }

    /// Overwrites `metrics:apiPerformance` and `metrics:endpoints`.
    pub async fn publish(&self) -> Result<()> {
        let (avg, calls, statuses, endpoints) = {
            let inner = self.lock();
            let avg = if inner.response_times.is_empty() {
                0.0
            } else {
                inner.response_times.iter().sum::<u64>() as f64 / inner.response_times.len() as f64
            };
            let minute = Utc::now().timestamp_millis() / 60_000;
            let calls = inner
                .minutes
                .iter()
                .filter(|bucket| bucket.minute >= minute - 1)
                .map(|bucket| bucket.success + bucket.error)
                .sum::<u64>();
            let endpoints: Vec<(String, serde_json::Value)> = inner
                .endpoints
                .iter()
                .map(|(pattern, window)| {
                    let avg_time = if window.samples.is_empty() {
                        0.0
                    } else {
                        window.samples.iter().sum::<u64>() as f64 / window.samples.len() as f64
                    };
                    (
                        pattern.clone(),
                        json!({
                            "avgTime": avg_time,
                            "calls": window.calls,
                            "lastUpdated": window.last_updated_ms,
                        }),
                    )
                })
                .collect();
            (avg, calls, inner.status_counts.clone(), endpoints)
        };
        self.store
            .publish_api_performance(avg, calls, &statuses)
            .await?;
        self.store.publish_endpoints(endpoints).await
    }
}

/// Collapses volatile path segments: 32-hex runs become `:uuid`, digit runs
/// become `:id`.
pub fn normalize_url_pattern(url: &str) -> String {
    let collapsed = HEX_ID.replace_all(url, ":uuid");
    NUMERIC_ID.replace_all(&collapsed, ":id").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use volley_store::MemoryKv;

    fn aggregator() -> MetricsAggregator {
        let store = Arc::new(ContextStore::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(3600),
        ));
        MetricsAggregator::new(store, Duration::from_secs(300))
    }

    fn ok(url: &str, duration_ms: u64) -> CallSample {
        CallSample {
            url: url.into(),
            status: Some(200),
            duration_ms,
            success: true,
        }
    }

    fn err(url: &str, status: u16) -> CallSample {
        CallSample {
            url: url.into(),
            status: Some(status),
            duration_ms: 100,
            success: false,
        }
    }

    #[test]
    fn url_patterns_collapse_ids() {
        assert_eq!(
            normalize_url_pattern("http://api/members/12345/records"),
            "http://api/members/:id/records"
        );
        assert_eq!(
            normalize_url_pattern("http://api/jobs/0123456789abcdef0123456789abcdef"),
            "http://api/jobs/:uuid"
        );
        assert_eq!(
            normalize_url_pattern("http://api/v2/members/42"),
            "http://api/v:id/members/:id"
        );
    }

    #[tokio::test]
    async fn response_window_keeps_last_twenty() {
        let metrics = aggregator();
        for i in 0..30u64 {
            metrics.observe(ok("http://api/echo", i)).await;
        }
        // Window holds 10..=29, mean 19.5.
        assert!((metrics.avg_response_time() - 19.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn error_fraction_counts_recent_buckets() {
        let metrics = aggregator();
        for _ in 0..6 {
            metrics.observe(ok("http://api/echo", 50)).await;
        }
        for _ in 0..4 {
            metrics.observe(err("http://api/echo", 500)).await;
        }
        let fraction = metrics.error_fraction(5);
        assert!((fraction - 0.4).abs() < 1e-9, "got {}", fraction);
    }

    #[tokio::test]
    async fn api_error_rate_unions_durable_timestamps() {
        let store = Arc::new(ContextStore::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(3600),
        ));
        let metrics = MetricsAggregator::new(store.clone(), Duration::from_secs(300));
        metrics.observe(err("http://api/echo", 503)).await;
        // A second host's error, only visible durably.
        store
            .push_error_timestamp(Utc::now().timestamp_millis() - 10_000)
            .await
            .expect("push");

        let rate = metrics.api_error_rate().await;
        assert!((rate - 2.0 / 5.0).abs() < 1e-9, "got {}", rate);
    }

    #[tokio::test]
    async fn publish_writes_performance_and_endpoints() {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(ContextStore::new(kv.clone(), Duration::from_secs(3600)));
        let metrics = MetricsAggregator::new(store, Duration::from_secs(300));
        metrics.observe(ok("http://api/members/7", 40)).await;
        metrics.publish().await.expect("publish");

        let performance = kv
            .hash_get_all("metrics:apiPerformance")
            .await
            .expect("performance");
        assert_eq!(performance["avgResponseTime"], "40.0");
        let endpoints = kv.hash_get_all("metrics:endpoints").await.expect("endpoints");
        assert!(endpoints.contains_key("http://api/members/:id"));
    }
}
