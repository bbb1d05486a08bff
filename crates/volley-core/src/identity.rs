//! Identity types for the volley dispatch engine.
//!
//! SessionId names a tenant session; JobId names one enqueued batch; RequestId
//! correlates a single record with its request traces; WorkerId names the host
//! process publishing worker metrics.

/// Identifies a tenant session (owns the target API URL and credentials).
pub type SessionId = String;

/// Identifies a batch job on the work queue.
pub type JobId = String;

/// Correlates one record with its request traces (`apidata:<session>:<request>`).
pub type RequestId = String;

/// Identifies the dispatching host process (`worker:globalMetrics:<worker>`).
pub type WorkerId = String;

/// Builds the trace id used as the durable key suffix for a request trace.
pub fn trace_id(session_id: &str, request_id: &str) -> String {
    format!("{}:{}", session_id, request_id)
}

/// Builds the id of a persisted user-action error.
pub fn user_action_error_id(session_id: &str, job_id: &str, ts_ms: i64) -> String {
    format!("{}:{}:{}", session_id, job_id, ts_ms)
}
