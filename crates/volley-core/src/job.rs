//! Batch jobs and their progress reporting shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{JobId, SessionId};
use crate::record::Record;

/// Queue-level job state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// The payload enqueued for one batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub session_id: SessionId,
    pub records: Vec<Record>,
    #[serde(default)]
    pub verbose: bool,
}

/// Progress snapshot pushed to the queue after every sub-batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub processed: usize,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub user_action_required_count: usize,
    pub avg_time_per_record_ms: f64,
    pub est_time_left_sec: u64,
    /// Waiting jobs behind this one at sample time.
    pub backlog: usize,
    /// Controller status string (e.g. "stable", "recovery", "breaker").
    pub controller_status: String,
    pub concurrency: usize,
}

/// Final accounting for a completed job (also written to `metrics:<jobId>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: JobId,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_records: usize,
    pub completed_at: DateTime<Utc>,
}

impl JobReport {
    /// A completed job accounts for every record exactly once.
    pub fn is_balanced(&self) -> bool {
        self.success_count + self.failure_count == self.total_records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobState::Waiting).expect("json"),
            "\"waiting\""
        );
    }

    #[test]
    fn spec_defaults_verbose_off() {
        let spec: JobSpec = serde_json::from_value(json!({
            "sessionId": "S1",
            "records": [{"memberId": "M1", "requestId": "R1"}],
        }))
        .expect("deserialize");
        assert!(!spec.verbose);
        assert_eq!(spec.records.len(), 1);
    }

    #[test]
    fn report_balance_check() {
        let report = JobReport {
            job_id: "J1".into(),
            success_count: 3,
            failure_count: 2,
            total_records: 5,
            completed_at: Utc::now(),
        };
        assert!(report.is_balanced());
    }
}
