//! Durable key namespace.
//!
//! This module is the single source of key layout; nothing else formats keys.
//! The namespace is shared across processes, so any change here is a
//! cross-host migration.

use volley_core::{JobId, RequestId, SessionId, WorkerId};

pub const API_PERFORMANCE: &str = "metrics:apiPerformance";
pub const ENDPOINTS: &str = "metrics:endpoints";
pub const ERROR_TIMESTAMPS: &str = "metrics:errorTimestamps";
pub const RATE_LIMITER: &str = "metrics:rateLimiter";
pub const RECORD_ERRORS: &str = "metrics:recordErrors";
pub const CIRCUIT_BREAKER: &str = "metrics:circuitBreaker";

/// `session:<sessionId>`: session JSON, configurable TTL.
pub fn session(session_id: &SessionId) -> String {
    format!("session:{}", session_id)
}

/// `user:sessions:<ownerUserId>`: list of session ids owned by a user.
pub fn user_sessions(owner_user_id: &str) -> String {
    format!("user:sessions:{}", owner_user_id)
}

/// `apidata:<sessionId>:<reqId>`: request trace hash.
pub fn api_data(session_id: &SessionId, request_id: &RequestId) -> String {
    format!("apidata:{}:{}", session_id, request_id)
}

/// `apirequests:<sessionId>`: sorted set of request ids scored by timestamp.
pub fn api_requests(session_id: &SessionId) -> String {
    format!("apirequests:{}", session_id)
}

/// `apistats:<sessionId>`: monotonic session counters.
pub fn api_stats(session_id: &SessionId) -> String {
    format!("apistats:{}", session_id)
}

/// `logs:<sessionId>`: structured log entries, 24h TTL.
pub fn session_logs(session_id: &SessionId) -> String {
    format!("logs:{}", session_id)
}

/// `metrics:<jobId>`: final job accounting hash.
pub fn job_metrics(job_id: &JobId) -> String {
    format!("metrics:{}", job_id)
}

/// `worker:globalMetrics:<workerId>`: worker metrics JSON.
pub fn worker_metrics(worker_id: &WorkerId) -> String {
    format!("worker:globalMetrics:{}", worker_id)
}

/// `userActionError:<errorId>`: user-action error JSON, 24h TTL.
pub fn user_action_error(error_id: &str) -> String {
    format!("userActionError:{}", error_id)
}

/// `userActionErrors:<sessionId>`: error id index, 24h TTL.
pub fn user_action_errors(session_id: &SessionId) -> String {
    format!("userActionErrors:{}", session_id)
}

/// `successResponse:<responseId>`: success response JSON, 24h TTL.
pub fn success_response(response_id: &str) -> String {
    format!("successResponse:{}", response_id)
}

/// `successResponses:<sessionId>`: response id index, 24h TTL.
pub fn success_responses(session_id: &SessionId) -> String {
    format!("successResponses:{}", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        let sid = "S1".to_string();
        assert_eq!(session(&sid), "session:S1");
        assert_eq!(user_sessions("u1"), "user:sessions:u1");
        assert_eq!(api_data(&sid, &"R1".to_string()), "apidata:S1:R1");
        assert_eq!(api_requests(&sid), "apirequests:S1");
        assert_eq!(api_stats(&sid), "apistats:S1");
        assert_eq!(session_logs(&sid), "logs:S1");
        assert_eq!(job_metrics(&"J1".to_string()), "metrics:J1");
        assert_eq!(worker_metrics(&"W1".to_string()), "worker:globalMetrics:W1");
        assert_eq!(user_action_error("S1:J1:1"), "userActionError:S1:J1:1");
        assert_eq!(user_action_errors(&sid), "userActionErrors:S1");
        assert_eq!(success_response("abc"), "successResponse:abc");
        assert_eq!(success_responses(&sid), "successResponses:S1");
    }
}
