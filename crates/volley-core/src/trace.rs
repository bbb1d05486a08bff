//! Persisted artifacts: request traces, per-session stats, user-action
//! errors, success responses, and worker metrics.
//!
//! Traces are stored as flat string hashes (one per session/request pair,
//! overwritten per attempt so the last attempt wins); everything else is
//! JSON. Field names here are the durable ones; do not rename without a
//! migration.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::ErrorCategory;
use crate::identity::{JobId, SessionId, WorkerId};
use crate::record::Record;

/// Full request/response artifact for one attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTrace {
    /// `<sessionId>:<requestId>`.
    pub trace_id: String,
    pub ts: DateTime<Utc>,
    pub url: String,
    pub method: String,
    pub request_headers: Value,
    pub request_body: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    pub response_headers: Value,
    pub response_body: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub time_ms: u64,
    /// 1-based attempt number; strictly increasing within a record.
    pub attempt: u32,
    pub is_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_trace_id: Option<String>,
}

impl RequestTrace {
    /// Flattens the trace into the durable hash representation.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("timestamp".into(), self.ts.timestamp_millis().to_string()),
            ("url".into(), self.url.clone()),
            ("method".into(), self.method.clone()),
            ("requestHeaders".into(), self.request_headers.to_string()),
            ("requestBody".into(), self.request_body.to_string()),
            ("responseHeaders".into(), self.response_headers.to_string()),
            ("responseBody".into(), self.response_body.to_string()),
            ("success".into(), flag(self.success)),
            ("timeMs".into(), self.time_ms.to_string()),
            ("attempt".into(), self.attempt.to_string()),
            ("isRetry".into(), flag(self.is_retry)),
        ];
        if let Some(status) = self.response_status {
            fields.push(("responseStatus".into(), status.to_string()));
        }
        if let Some(message) = &self.error_message {
            fields.push(("errorMessage".into(), message.clone()));
        }
        if let Some(original) = &self.original_trace_id {
            fields.push(("originalTraceId".into(), original.clone()));
        }
        fields
    }

    /// Rebuilds a trace from its hash fields. Readers must tolerate partial
    /// hashes (the index may reference a trace mid-write); missing fields
    /// fall back to empty values.
    pub fn from_fields(trace_id: &str, fields: &HashMap<String, String>) -> Self {
        let ts_ms = fields
            .get("timestamp")
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        Self {
            trace_id: trace_id.to_string(),
            ts: Utc
                .timestamp_millis_opt(ts_ms)
                .single()
                .unwrap_or_else(Utc::now),
            url: fields.get("url").cloned().unwrap_or_default(),
            method: fields.get("method").cloned().unwrap_or_default(),
            request_headers: parse_json(fields.get("requestHeaders")),
            request_body: parse_json(fields.get("requestBody")),
            response_status: fields
                .get("responseStatus")
                .and_then(|raw| raw.parse().ok()),
            response_headers: parse_json(fields.get("responseHeaders")),
            response_body: parse_json(fields.get("responseBody")),
            success: fields.get("success").map(String::as_str) == Some("1"),
            error_message: fields.get("errorMessage").cloned(),
            time_ms: fields
                .get("timeMs")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            attempt: fields
                .get("attempt")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1),
            is_retry: fields.get("isRetry").map(String::as_str) == Some("1"),
            original_trace_id: fields.get("originalTraceId").cloned(),
        }
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn parse_json(raw: Option<&String>) -> Value {
    raw.and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null)
}

/// Monotonic per-session counters (`apistats:<sessionId>`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Terminal status histogram keyed by HTTP status code.
    pub status_counts: HashMap<u16, u64>,
}

impl SessionStats {
    /// Parses the durable hash (`total`, `success`, `failure`, `status:<code>`).
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let mut stats = SessionStats::default();
        for (field, raw) in fields {
            let Ok(count) = raw.parse::<u64>() else {
                continue;
            };
            match field.as_str() {
                "total" => stats.total = count,
                "success" => stats.success = count,
                "failure" => stats.failure = count,
                other => {
                    if let Some(code) = other
                        .strip_prefix("status:")
                        .and_then(|code| code.parse().ok())
                    {
                        stats.status_counts.insert(code, count);
                    }
                }
            }
        }
        stats
    }
}

/// A terminal failure requiring human remediation, kept for manual replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActionError {
    /// `<sessionId>:<jobId>:<ts>`.
    pub error_id: String,
    pub session_id: SessionId,
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action_guidance: Option<String>,
    /// The original record, verbatim, so the call can be replayed.
    pub record: Record,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A successful terminal response, kept for inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub response_id: String,
    pub session_id: SessionId,
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    pub status_code: u16,
    pub headers: Value,
    pub data: Value,
    pub record: Record,
    pub duration_ms: u64,
}

/// One progress sample retained in the worker-metrics history.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub ts: DateTime<Utc>,
    pub completed: usize,
    pub total: usize,
    pub avg_time_per_record_ms: f64,
}

/// Host-level metrics published under `worker:globalMetrics:<workerId>`.
///
/// Overwritten on every publish; external aggregation reads across workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub current_concurrency: usize,
    pub avg_time_per_record_ms: f64,
    pub est_time_left_sec: u64,
    pub success_count: usize,
    pub failure_count: usize,
    pub completed: usize,
    pub total: usize,
    pub backlog: usize,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub avg_error: f64,
    /// Bounded history (most recent last, at most 20 samples).
    pub progress_history: Vec<ProgressSample>,
    pub controller_status: String,
    pub circuit_breaker_active: bool,
    pub recovery_active: bool,
    pub timestamp: DateTime<Utc>,
}

/// Durable mirror of the process-wide circuit breaker (`metrics:circuitBreaker`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerRecord {
    pub last_tripped: DateTime<Utc>,
    pub reason: String,
    pub reset_timeout_ms: u64,
    /// Signal snapshot captured at trip time.
    pub metrics: Value,
}
