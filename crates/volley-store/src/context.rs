//! Context store: the durable write path for sessions, request traces,
//! per-session stats, user-action errors, success responses, and metrics.
//!
//! Thin policy layer over [`KvStore`]: it owns the key namespace, the TTL
//! rules (set on first insert, refreshed on every mutation), and the
//! batching of multi-key updates into one round-trip. Stats increments for
//! a terminal outcome travel in the same batch as the trace write, so the
//! `total = success + failure` invariant holds between round-trips.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use volley_core::{
    CircuitBreakerRecord, DispatchError, JobReport, RequestTrace, Result, Session, SessionId,
    SessionStats, SuccessResponse, UserActionError, WorkerMetrics,
};

use crate::keys;
use crate::kv::{KvOp, KvStore};
use crate::log_sink::LogSink;

const DAY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Stats increments attached to a terminal attempt's trace write.
#[derive(Clone, Copy, Debug)]
pub struct TerminalOutcome {
    pub success: bool,
    pub status: Option<u16>,
}

/// Durable write path shared by the pipeline, controller, and batch worker.
pub struct ContextStore {
    kv: Arc<dyn KvStore>,
    session_ttl: Duration,
    log_sink: RwLock<Option<Arc<dyn LogSink>>>,
}

impl ContextStore {
    pub fn new(kv: Arc<dyn KvStore>, session_ttl: Duration) -> Self {
        Self {
            kv,
            session_ttl,
            log_sink: RwLock::new(None),
        }
    }

    /// Wires the real log sink after construction (see module docs on the
    /// logger/store cycle). Until called, entries fall back to stderr.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self
            .log_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    // ---- sessions ----

    /// Persists a new session and indexes it under its owner.
    pub async fn init_session(&self, session: &Session) -> Result<()> {
        let value = serde_json::to_value(session)
            .map_err(|e| DispatchError::Store(format!("session encode: {}", e)))?;
        let mut ops = vec![KvOp::SetJson {
            key: keys::session(&session.session_id),
            value,
            ttl: Some(self.session_ttl),
        }];
        if let Some(owner) = &session.owner_user_id {
            ops.push(KvOp::ListPush {
                key: keys::user_sessions(owner),
                value: session.session_id.clone(),
            });
        }
        self.kv.apply(ops).await
    }

    /// Loads a session, refreshing its TTL on the way out.
    pub async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let key = keys::session(session_id);
        let Some(value) = self.kv.get_json(&key).await? else {
            return Ok(None);
        };
        let session: Session = serde_json::from_value(value)
            .map_err(|e| DispatchError::Store(format!("session decode: {}", e)))?;
        self.kv
            .apply(vec![KvOp::Expire {
                key,
                ttl: self.session_ttl,
            }])
            .await?;
        Ok(Some(session))
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        self.kv.delete(&keys::session(session_id)).await
    }

    /// Session ids ever registered for an owner (may include expired ones).
    pub async fn sessions_for_owner(&self, owner_user_id: &str) -> Result<Vec<SessionId>> {
        self.kv
            .list_range(&keys::user_sessions(owner_user_id), 0, -1)
            .await
    }

    // ---- request traces and stats ----

    /// Writes one attempt's trace and indexes it; when the attempt is
    /// terminal, the session-stats increments ride in the same batch.
    pub async fn record_trace(
        &self,
        session_id: &SessionId,
        request_id: &str,
        trace: &RequestTrace,
        terminal: Option<TerminalOutcome>,
    ) -> Result<()> {
        let mut ops = vec![
            KvOp::HashSet {
                key: keys::api_data(session_id, &request_id.to_string()),
                fields: trace.to_fields(),
            },
            KvOp::ZsetAdd {
                key: keys::api_requests(session_id),
                member: request_id.to_string(),
                score: trace.ts.timestamp_millis() as f64,
            },
        ];
        if let Some(outcome) = terminal {
            let stats_key = keys::api_stats(session_id);
            ops.push(KvOp::HashIncr {
                key: stats_key.clone(),
                field: "total".into(),
                by: 1,
            });
            ops.push(KvOp::HashIncr {
                key: stats_key.clone(),
                field: if outcome.success { "success" } else { "failure" }.into(),
                by: 1,
            });
            if let Some(status) = outcome.status {
                ops.push(KvOp::HashIncr {
                    key: stats_key,
                    field: format!("status:{}", status),
                    by: 1,
                });
            }
        }
        self.kv.apply(ops).await
    }

    pub async fn session_stats(&self, session_id: &SessionId) -> Result<SessionStats> {
        let fields = self.kv.hash_get_all(&keys::api_stats(session_id)).await?;
        Ok(SessionStats::from_fields(&fields))
    }

    /// Ranged request history with trace hydration. Index entries whose
    /// trace hash is not yet visible are skipped, not errors.
    pub async fn request_history(
        &self,
        session_id: &SessionId,
        min_ts_ms: i64,
        max_ts_ms: i64,
        limit: usize,
    ) -> Result<Vec<RequestTrace>> {
        let members = self
            .kv
            .zset_range_by_score(
                &keys::api_requests(session_id),
                min_ts_ms as f64,
                max_ts_ms as f64,
                limit,
            )
            .await?;
        let mut traces = Vec::with_capacity(members.len());
        for (request_id, _) in members {
            let fields = self
                .kv
                .hash_get_all(&keys::api_data(session_id, &request_id))
                .await?;
            if fields.is_empty() {
                continue;
            }
            let trace_id = volley_core::trace_id(session_id, &request_id);
            traces.push(RequestTrace::from_fields(&trace_id, &fields));
        }
        Ok(traces)
    }

    // ---- user-action errors ----

    pub async fn record_user_action_error(&self, error: &UserActionError) -> Result<()> {
        let value = serde_json::to_value(error)
            .map_err(|e| DispatchError::Store(format!("user-action error encode: {}", e)))?;
        let index_key = keys::user_action_errors(&error.session_id);
        self.kv
            .apply(vec![
                KvOp::SetJson {
                    key: keys::user_action_error(&error.error_id),
                    value,
                    ttl: Some(DAY_TTL),
                },
                KvOp::ListPush {
                    key: index_key.clone(),
                    value: error.error_id.clone(),
                },
                KvOp::Expire {
                    key: index_key,
                    ttl: DAY_TTL,
                },
            ])
            .await
    }

    pub async fn get_user_action_error(&self, error_id: &str) -> Result<Option<UserActionError>> {
        let Some(value) = self.kv.get_json(&keys::user_action_error(error_id)).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| DispatchError::Store(format!("user-action error decode: {}", e)))
    }

    /// Unexpired user-action errors for a session, oldest first.
    pub async fn list_user_action_errors(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<UserActionError>> {
        let ids = self
            .kv
            .list_range(&keys::user_action_errors(session_id), 0, -1)
            .await?;
        let mut errors = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(error) = self.get_user_action_error(&id).await? {
                errors.push(error);
            }
        }
        Ok(errors)
    }

    /// Marks an error resolved. Returns false when the error has expired.
    pub async fn resolve_user_action_error(
        &self,
        error_id: &str,
        resolution: impl Into<String>,
    ) -> Result<bool> {
        let Some(mut error) = self.get_user_action_error(error_id).await? else {
            return Ok(false);
        };
        error.resolved = true;
        error.resolution = Some(resolution.into());
        error.resolved_at = Some(Utc::now());
        let value = serde_json::to_value(&error)
            .map_err(|e| DispatchError::Store(format!("user-action error encode: {}", e)))?;
        self.kv
            .apply(vec![KvOp::SetJson {
                key: keys::user_action_error(error_id),
                value,
                ttl: Some(DAY_TTL),
            }])
            .await?;
        Ok(true)
    }

    // ---- success responses ----

    pub async fn record_success_response(&self, response: &SuccessResponse) -> Result<()> {
        let value = serde_json::to_value(response)
            .map_err(|e| DispatchError::Store(format!("success response encode: {}", e)))?;
        let index_key = keys::success_responses(&response.session_id);
        self.kv
            .apply(vec![
                KvOp::SetJson {
                    key: keys::success_response(&response.response_id),
                    value,
                    ttl: Some(DAY_TTL),
                },
                KvOp::ListPush {
                    key: index_key.clone(),
                    value: response.response_id.clone(),
                },
                KvOp::Expire {
                    key: index_key,
                    ttl: DAY_TTL,
                },
            ])
            .await
    }

    /// The most recent success responses for a session, newest first.
    pub async fn list_success_responses(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<SuccessResponse>> {
        let ids = self
            .kv
            .list_range(&keys::success_responses(session_id), -(limit as i64), -1)
            .await?;
        let mut responses = Vec::with_capacity(ids.len());
        for id in ids.into_iter().rev() {
            let Some(value) = self.kv.get_json(&keys::success_response(&id)).await? else {
                continue;
            };
            let response: SuccessResponse = serde_json::from_value(value)
                .map_err(|e| DispatchError::Store(format!("success response decode: {}", e)))?;
            responses.push(response);
        }
        Ok(responses)
    }

    // ---- metrics publication ----

    /// Counts a terminal 429/5xx failure against its endpoint.
    pub async fn bump_record_error(
        &self,
        url: &str,
        status: Option<u16>,
        details: &str,
    ) -> Result<()> {
        let field = match status {
            Some(status) => format!("{}:{}", url, status),
            None => format!("{}:network", url),
        };
        self.kv
            .apply(vec![
                KvOp::HashIncr {
                    key: keys::RECORD_ERRORS.into(),
                    field: field.clone(),
                    by: 1,
                },
                KvOp::HashSet {
                    key: keys::RECORD_ERRORS.into(),
                    fields: vec![
                        ("lastError".into(), field),
                        (
                            "lastErrorDetails".into(),
                            json!({
                                "message": details,
                                "timestamp": Utc::now().timestamp_millis(),
                            })
                            .to_string(),
                        ),
                    ],
                },
            ])
            .await
    }

    pub async fn record_errors(&self) -> Result<HashMap<String, String>> {
        self.kv.hash_get_all(keys::RECORD_ERRORS).await
    }

    /// Appends an error timestamp to the shared durable window (trimmed to
    /// the last 100 entries).
    pub async fn push_error_timestamp(&self, ts_ms: i64) -> Result<()> {
        self.kv
            .apply(vec![
                KvOp::ListPush {
                    key: keys::ERROR_TIMESTAMPS.into(),
                    value: ts_ms.to_string(),
                },
                KvOp::ListTrimLast {
                    key: keys::ERROR_TIMESTAMPS.into(),
                    keep: 100,
                },
            ])
            .await
    }

    /// Durable error timestamps at or after `since_ms`.
    pub async fn recent_error_timestamps(&self, since_ms: i64) -> Result<Vec<i64>> {
        let raw = self.kv.list_range(keys::ERROR_TIMESTAMPS, 0, -1).await?;
        Ok(raw
            .into_iter()
            .filter_map(|entry| entry.parse::<i64>().ok())
            .filter(|ts| *ts >= since_ms)
            .collect())
    }

    pub async fn publish_rate_limiter(
        &self,
        max_concurrent: usize,
        min_time_ms: u64,
        error_rate: f64,
        avg_response_ms: f64,
    ) -> Result<()> {
        self.kv
            .apply(vec![KvOp::HashSet {
                key: keys::RATE_LIMITER.into(),
                fields: vec![
                    ("maxConcurrent".into(), max_concurrent.to_string()),
                    ("minTime".into(), min_time_ms.to_string()),
                    ("errorRate".into(), format!("{:.4}", error_rate)),
                    ("avgResponseTime".into(), format!("{:.1}", avg_response_ms)),
                    (
                        "lastUpdated".into(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                ],
            }])
            .await
    }

    pub async fn publish_api_performance(
        &self,
        avg_response_time: f64,
        calls_last_minute: u64,
        status_codes: &HashMap<u16, u64>,
    ) -> Result<()> {
        let codes: HashMap<String, u64> = status_codes
            .iter()
            .map(|(code, count)| (code.to_string(), *count))
            .collect();
        self.kv
            .apply(vec![KvOp::HashSet {
                key: keys::API_PERFORMANCE.into(),
                fields: vec![
                    ("avgResponseTime".into(), format!("{:.1}", avg_response_time)),
                    ("callsLastMinute".into(), calls_last_minute.to_string()),
                    (
                        "timestamp".into(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                    ("statusCodes".into(), json!(codes).to_string()),
                ],
            }])
            .await
    }

    /// Publishes per-endpoint aggregates: `urlPattern -> {avgTime, calls, lastUpdated}`.
    pub async fn publish_endpoints(&self, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let fields = entries
            .into_iter()
            .map(|(pattern, stat)| (pattern, stat.to_string()))
            .collect();
        self.kv
            .apply(vec![KvOp::HashSet {
                key: keys::ENDPOINTS.into(),
                fields,
            }])
            .await
    }

    pub async fn publish_circuit_breaker(&self, record: &CircuitBreakerRecord) -> Result<()> {
        self.kv
            .apply(vec![KvOp::HashSet {
                key: keys::CIRCUIT_BREAKER.into(),
                fields: vec![
                    (
                        "lastTripped".into(),
                        record.last_tripped.timestamp_millis().to_string(),
                    ),
                    ("reason".into(), record.reason.clone()),
                    ("resetTimeout".into(), record.reset_timeout_ms.to_string()),
                    ("metrics".into(), record.metrics.to_string()),
                ],
            }])
            .await
    }

    pub async fn publish_worker_metrics(&self, metrics: &WorkerMetrics) -> Result<()> {
        let value = serde_json::to_value(metrics)
            .map_err(|e| DispatchError::Store(format!("worker metrics encode: {}", e)))?;
        self.kv
            .apply(vec![KvOp::SetJson {
                key: keys::worker_metrics(&metrics.worker_id),
                value,
                ttl: None,
            }])
            .await
    }

    pub async fn write_job_metrics(&self, report: &JobReport) -> Result<()> {
        self.kv
            .apply(vec![KvOp::HashSet {
                key: keys::job_metrics(&report.job_id),
                fields: vec![
                    ("successCount".into(), report.success_count.to_string()),
                    ("failureCount".into(), report.failure_count.to_string()),
                    ("totalRecords".into(), report.total_records.to_string()),
                    (
                        "completedAt".into(),
                        report.completed_at.timestamp_millis().to_string(),
                    ),
                ],
            }])
            .await
    }

    // ---- structured logs ----

    /// Best-effort structured log entry for a session.
    pub async fn log(&self, session_id: &SessionId, entry: Value) {
        let sink = self
            .log_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => sink.log(session_id, entry).await,
            None => eprintln!("[{}] {}", session_id, entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use chrono::TimeZone;
    use serde_json::json;
    use volley_core::{ErrorCategory, Record, SessionAuth};

    fn store() -> (Arc<MemoryKv>, ContextStore) {
        let kv = Arc::new(MemoryKv::new());
        let store = ContextStore::new(kv.clone(), Duration::from_secs(7 * 24 * 60 * 60));
        (kv, store)
    }

    fn trace(ts_ms: i64, attempt: u32, success: bool, status: Option<u16>) -> RequestTrace {
        RequestTrace {
            trace_id: "S1:R1".into(),
            ts: Utc.timestamp_millis_opt(ts_ms).single().expect("ts"),
            url: "http://api/echo".into(),
            method: "POST".into(),
            request_headers: json!({}),
            request_body: json!({"memberId": "M1", "requestId": "R1"}),
            response_status: status,
            response_headers: json!({}),
            response_body: json!({}),
            success,
            error_message: None,
            time_ms: 40,
            attempt,
            is_retry: attempt > 1,
            original_trace_id: None,
        }
    }

    #[tokio::test]
    async fn session_round_trip_and_owner_index() {
        let (_kv, store) = store();
        let session = Session::new(
            "S1",
            "http://api/echo",
            SessionAuth {
                user_id: "u1".into(),
                api_key: "k1".into(),
            },
        )
        .with_owner("owner-1");
        store.init_session(&session).await.expect("init");

        let loaded = store
            .get_session(&"S1".to_string())
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.api_url, "http://api/echo");
        assert_eq!(
            store.sessions_for_owner("owner-1").await.expect("owner"),
            vec!["S1".to_string()]
        );

        assert!(store.delete_session(&"S1".to_string()).await.expect("delete"));
        assert!(store
            .get_session(&"S1".to_string())
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn terminal_trace_updates_stats_in_one_batch() {
        let (kv, store) = store();
        let sid = "S1".to_string();
        store
            .record_trace(&sid, "R1", &trace(1_000, 1, true, Some(200)), None)
            .await
            .expect("attempt trace");
        // Non-terminal attempt leaves stats untouched.
        let stats = store.session_stats(&sid).await.expect("stats");
        assert_eq!(stats.total, 0);

        store
            .record_trace(
                &sid,
                "R1",
                &trace(2_000, 2, true, Some(200)),
                Some(TerminalOutcome {
                    success: true,
                    status: Some(200),
                }),
            )
            .await
            .expect("terminal trace");

        let stats = store.session_stats(&sid).await.expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.status_counts[&200], 1);

        // The index holds the request id once, scored by the latest attempt.
        let members = kv
            .zset_range_by_score("apirequests:S1", 0.0, f64::MAX, 10)
            .await
            .expect("zset");
        assert_eq!(members, vec![("R1".to_string(), 2_000.0)]);
    }

    #[tokio::test]
    async fn request_history_skips_unhydrated_index_entries() {
        let (kv, store) = store();
        let sid = "S1".to_string();
        store
            .record_trace(&sid, "R1", &trace(1_000, 1, true, Some(200)), None)
            .await
            .expect("trace");
        // Simulate an index entry whose trace hash is not yet written.
        kv.apply(vec![KvOp::ZsetAdd {
            key: "apirequests:S1".into(),
            member: "R2".into(),
            score: 1_500.0,
        }])
        .await
        .expect("index ahead of trace");

        let history = store
            .request_history(&sid, 0, 10_000, 10)
            .await
            .expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trace_id, "S1:R1");
    }

    #[tokio::test]
    async fn user_action_error_lifecycle() {
        let (_kv, store) = store();
        let error = UserActionError {
            error_id: "S1:J1:1000".into(),
            session_id: "S1".into(),
            job_id: "J1".into(),
            ts: Utc::now(),
            status_code: Some(422),
            category: ErrorCategory::RequiresUserAction,
            message: "bad date".into(),
            validation_errors: Some(vec!["bad date".into()]),
            permission_info: None,
            user_action_guidance: None,
            record: Record::new(json!({"memberId": "M1", "requestId": "R1"})),
            resolved: false,
            resolution: None,
            resolved_at: None,
        };
        store.record_user_action_error(&error).await.expect("record");

        let listed = store
            .list_user_action_errors(&"S1".to_string())
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].resolved);

        assert!(store
            .resolve_user_action_error("S1:J1:1000", "fixed the date")
            .await
            .expect("resolve"));
        let resolved = store
            .get_user_action_error("S1:J1:1000")
            .await
            .expect("get")
            .expect("present");
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution.as_deref(), Some("fixed the date"));
        assert!(resolved.resolved_at.is_some());

        assert!(!store
            .resolve_user_action_error("S1:J1:missing", "n/a")
            .await
            .expect("resolve missing"));
    }

    #[tokio::test]
    async fn success_responses_list_newest_first() {
        let (_kv, store) = store();
        for (id, ts) in [("a", 1), ("b", 2), ("c", 3)] {
            let response = SuccessResponse {
                response_id: id.into(),
                session_id: "S1".into(),
                job_id: "J1".into(),
                ts: Utc.timestamp_millis_opt(ts).single().expect("ts"),
                status_code: 200,
                headers: json!({}),
                data: json!({"ok": true}),
                record: Record::new(json!({"memberId": "M1", "requestId": id})),
                duration_ms: 40,
            };
            store
                .record_success_response(&response)
                .await
                .expect("record");
        }
        let listed = store
            .list_success_responses(&"S1".to_string(), 2)
            .await
            .expect("list");
        let ids: Vec<&str> = listed.iter().map(|r| r.response_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn error_timestamps_trim_to_last_hundred() {
        let (_kv, store) = store();
        for ts in 0..110 {
            store.push_error_timestamp(ts).await.expect("push");
        }
        let recent = store.recent_error_timestamps(0).await.expect("recent");
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0], 10);
    }

    #[tokio::test]
    async fn record_error_bump_tracks_last_error() {
        let (_kv, store) = store();
        store
            .bump_record_error("http://api/echo", Some(503), "upstream down")
            .await
            .expect("bump");
        store
            .bump_record_error("http://api/echo", Some(503), "upstream down")
            .await
            .expect("bump");
        let errors = store.record_errors().await.expect("read");
        assert_eq!(errors["http://api/echo:503"], "2");
        assert_eq!(errors["lastError"], "http://api/echo:503");
        assert!(errors["lastErrorDetails"].contains("upstream down"));
    }

    #[tokio::test]
    async fn circuit_breaker_record_round_trips() {
        let (kv, store) = store();
        let record = CircuitBreakerRecord {
            last_tripped: Utc.timestamp_millis_opt(5_000).single().expect("ts"),
            reason: "error rate 0.42 over threshold".into(),
            reset_timeout_ms: 60_000,
            metrics: json!({"avgError": 0.42}),
        };
        store.publish_circuit_breaker(&record).await.expect("publish");
        let fields = kv.hash_get_all("metrics:circuitBreaker").await.expect("read");
        assert_eq!(fields["lastTripped"], "5000");
        assert_eq!(fields["resetTimeout"], "60000");
    }
}
