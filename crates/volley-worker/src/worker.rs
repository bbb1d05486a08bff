//! Batch worker: turns one queued job into per-record pool work.
//!
//! A job is exclusively owned by the worker that claimed it. Records flow
//! through the pool in fixed sub-batches; each sub-batch is awaited before
//! the next begins, and progress plus worker metrics are published after
//! every one. Per-record failures never fail the job; only precondition
//! violations (invalid records, missing session, unreachable store) do.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use volley_core::{
    validate_batch, JobProgress, JobReport, ProgressSample, Session, WorkerId, WorkerMetrics,
};
use volley_control::ControllerStatus;
use volley_dispatch::{
    PoolTask, RecordPipeline, RecordProcessor, RetryConfig, TaskContext, TaskKind, TaskOutcome,
    WorkerPool,
};
use volley_store::ContextStore;

use crate::queue::{JobQueue, QueuedJob};

/// Fixed sub-batch size: one awaitable pool invocation.
pub const SUB_BATCH_SIZE: usize = 10;

const PROGRESS_HISTORY_LIMIT: usize = 20;

/// Source of the controller snapshot included in progress reports.
pub trait StatusProbe: Send + Sync {
    fn controller_status(&self) -> ControllerStatus;
}

impl StatusProbe for volley_control::AdaptiveController {
    fn controller_status(&self) -> ControllerStatus {
        self.status()
    }
}

/// How a job ended, for callers that drive jobs directly (tests, serial
/// tools). The queue has already been updated either way.
#[derive(Clone, Debug)]
pub enum JobVerdict {
    Completed(JobReport),
    /// Precondition violation; the reason also reached the queue.
    Rejected(String),
}

/// Processes queued jobs end to end.
pub struct BatchWorker {
    worker_id: WorkerId,
    store: Arc<ContextStore>,
    pool: Arc<WorkerPool>,
    pipeline: Arc<RecordPipeline>,
    queue: Arc<dyn JobQueue>,
    status: Arc<dyn StatusProbe>,
}

/// Builds the outbound header set for a session.
pub fn auth_headers(session: &Session) -> Vec<(String, String)> {
    let token = BASE64.encode(format!(
        "{}:{}",
        session.auth.user_id, session.auth.api_key
    ));
    vec![
        ("Content-Type".into(), "application/json".into()),
        ("User-Agent".into(), "POC-Excel-Formatter/1.0".into()),
        ("Authorization".into(), format!("Basic {}", token)),
        ("X-User-Id".into(), session.auth.user_id.clone()),
    ]
}

impl BatchWorker {
    pub fn new(
        worker_id: impl Into<WorkerId>,
        store: Arc<ContextStore>,
        pool: Arc<WorkerPool>,
        pipeline: Arc<RecordPipeline>,
        queue: Arc<dyn JobQueue>,
        status: Arc<dyn StatusProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id: worker_id.into(),
            store,
            pool,
            pipeline,
            queue,
            status,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Runs one claimed job to its terminal state.
    pub async fn process_job(&self, job: &QueuedJob) -> JobVerdict {
        let job_id = &job.job_id;
        let session_id = &job.spec.session_id;

        if let Err(validation) = validate_batch(&job.spec.records) {
            let reason = validation.to_string();
            tracing::warn!(job_id = %job_id, reason = %reason, "rejecting job with invalid records");
            if let Err(e) = self.queue.fail_permanently(job_id, reason.clone()).await {
                tracing::error!(job_id = %job_id, error = %e, "queue rejection failed");
            }
            return JobVerdict::Rejected(reason);
        }

        let session = match self.store.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                let reason = "No config found".to_string();
                tracing::warn!(job_id = %job_id, session_id = %session_id, "rejecting job without session");
                if let Err(e) = self.queue.fail_permanently(job_id, reason.clone()).await {
                    tracing::error!(job_id = %job_id, error = %e, "queue rejection failed");
                }
                return JobVerdict::Rejected(reason);
            }
            Err(e) => {
                // The store being down at job start is retryable at the
                // queue level; the queue's native backoff covers it.
                let reason = format!("session load failed: {}", e);
                tracing::error!(job_id = %job_id, error = %e, "session load failed");
                if let Err(e) = self.queue.fail(job_id, reason.clone()).await {
                    tracing::error!(job_id = %job_id, error = %e, "queue failure report failed");
                }
                return JobVerdict::Rejected(reason);
            }
        };

        let headers = auth_headers(&session);
        let total = job.spec.records.len();
        tracing::info!(job_id = %job_id, session_id = %session_id, total, "START batch job");
        self.store
            .log(
                session_id,
                json!({
                    "event": "START",
                    "jobId": job_id,
                    "totalRecords": total,
                    "timestamp": Utc::now().timestamp_millis(),
                }),
            )
            .await;

        let started = Instant::now();
        let mut success_count = 0usize;
        let mut failure_count = 0usize;
        let mut user_action_required_count = 0usize;
        let mut processed = 0usize;
        let mut progress_history: Vec<ProgressSample> = Vec::new();

        for chunk in job.spec.records.chunks(SUB_BATCH_SIZE) {
            let tasks: Vec<PoolTask> = chunk
                .iter()
                .map(|record| PoolTask {
                    kind: TaskKind::ApiCall,
                    record: record.clone(),
                    context: TaskContext {
                        session_id: session_id.clone(),
                        job_id: job_id.clone(),
                        api_url: session.api_url.clone(),
                        headers: headers.clone(),
                        retry: RetryConfig::default(),
                        verbose: job.spec.verbose,
                    },
                })
                .collect();

            let outcomes = self.pool.batch_process(tasks.clone()).await;
            let outcomes = if pool_disaster(&outcomes) {
                tracing::warn!(job_id = %job_id, "pool unavailable; falling back to serial processing");
                let mut serial = Vec::with_capacity(tasks.len());
                for pool_task in tasks {
                    serial.push(self.pipeline.process(pool_task).await);
                }
                serial
            } else {
                outcomes
            };

            for outcome in &outcomes {
                if outcome.success {
                    success_count += 1;
                } else {
                    failure_count += 1;
                    if outcome.user_action_required {
                        user_action_required_count += 1;
                    }
                }
            }
            processed += outcomes.len();

            let status = self.status.controller_status();
            let elapsed_ms = started.elapsed().as_millis() as f64;
            let avg_time_per_record_ms = elapsed_ms / processed.max(1) as f64;
            let records_left = total - processed;
            let width = status.concurrency.max(1);
            let est_time_left_sec =
                (avg_time_per_record_ms * records_left as f64 / width as f64 / 1000.0).ceil()
                    as u64;

            progress_history.push(ProgressSample {
                ts: Utc::now(),
                completed: processed,
                total,
                avg_time_per_record_ms,
            });
            if progress_history.len() > PROGRESS_HISTORY_LIMIT {
                progress_history.remove(0);
            }

            let backlog = self
                .queue
                .count_by_state(volley_core::JobState::Waiting)
                .await
                .unwrap_or(0);
            let progress = JobProgress {
                processed,
                total,
                success_count,
                failure_count,
                user_action_required_count,
                avg_time_per_record_ms,
                est_time_left_sec,
                backlog,
                controller_status: status.status.clone(),
                concurrency: status.concurrency,
            };
            if let Err(e) = self.queue.update_progress(job_id, progress).await {
                tracing::warn!(job_id = %job_id, error = %e, "progress update failed");
            }

            let metrics = WorkerMetrics {
                worker_id: self.worker_id.clone(),
                current_concurrency: status.concurrency,
                avg_time_per_record_ms,
                est_time_left_sec,
                success_count,
                failure_count,
                completed: processed,
                total,
                backlog,
                avg_cpu: status.avg_cpu,
                avg_mem: status.avg_mem,
                avg_error: status.avg_error,
                progress_history: progress_history.clone(),
                controller_status: status.status.clone(),
                circuit_breaker_active: status.breaker_active,
                recovery_active: status.recovery_active,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.store.publish_worker_metrics(&metrics).await {
                tracing::warn!(error = %e, "worker metrics publish failed");
            }
        }

        let report = JobReport {
            job_id: job_id.clone(),
            success_count,
            failure_count,
            total_records: total,
            completed_at: Utc::now(),
        };
        if let Err(e) = self.store.write_job_metrics(&report).await {
            tracing::warn!(job_id = %job_id, error = %e, "job metrics write failed");
        }
        if let Err(e) = self
            .queue
            .complete(
                job_id,
                json!({
                    "successCount": success_count,
                    "failureCount": failure_count,
                    "totalRecords": total,
                }),
            )
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "queue completion failed");
        }
        tracing::info!(
            job_id,
            success_count,
            failure_count,
            user_action_required_count,
            "COMPLETE batch job"
        );
        self.store
            .log(
                session_id,
                json!({
                    "event": "COMPLETE",
                    "jobId": job_id,
                    "successCount": success_count,
                    "failureCount": failure_count,
                    "totalRecords": total,
                    "timestamp": Utc::now().timestamp_millis(),
                }),
            )
            .await;
        JobVerdict::Completed(report)
    }
}

/// A sub-batch where nothing reached a worker (delivery failures or pool
/// shutdown across the board) signals a pool-level disaster.
fn pool_disaster(outcomes: &[TaskOutcome]) -> bool {
    !outcomes.is_empty()
        && outcomes.iter().all(|outcome| {
            outcome
                .error
                .as_ref()
                .is_some_and(|error| error.message.contains("could not be delivered"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use volley_core::{Record, SessionAuth};

    #[test]
    fn auth_headers_carry_basic_token_and_user_id() {
        let session = Session::new(
            "S1",
            "http://api/echo",
            SessionAuth {
                user_id: "u1".into(),
                api_key: "k1".into(),
            },
        );
        let headers = auth_headers(&session);
        let auth = headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .expect("authorization header");
        assert_eq!(auth, format!("Basic {}", BASE64.encode("u1:k1")));
        assert!(headers
            .iter()
            .any(|(name, value)| name == "X-User-Id" && value == "u1"));
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Content-Type" && value == "application/json"));
    }

    #[test]
    fn pool_disaster_requires_uniform_delivery_failure() {
        let record = Record::new(json!({"memberId": "M1", "requestId": "R1"}));
        let delivery = TaskOutcome::failure(
            record.clone(),
            volley_core::ApiError::system("task could not be delivered to the pool"),
        );
        let ordinary = TaskOutcome::failure(
            record.clone(),
            volley_core::ApiError::system("worker crashed while processing task"),
        );
        let success = TaskOutcome::success(record, json!({}));

        assert!(pool_disaster(&[delivery.clone(), delivery.clone()]));
        assert!(!pool_disaster(&[delivery.clone(), ordinary]));
        assert!(!pool_disaster(&[delivery, success]));
        assert!(!pool_disaster(&[]));
    }
}
