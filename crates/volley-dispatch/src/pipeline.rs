//! Per-record execution pipeline.
//!
//! For each record: circuit-breaker gate -> rate-limited HTTP attempt ->
//! classification -> retry decision, with a durable trace for every attempt
//! that reaches the executor and terminal bookkeeping for the outcome.
//! Attempts within a record are strictly serial with increasing attempt
//! numbers; stats increments ride the terminal attempt's trace batch.
//!
//! Persistence failures are non-fatal here: the record's outcome stands,
//! the write is logged and dropped. The batch worker never halts a job on
//! a per-record failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use volley_core::{
    trace_id, user_action_error_id, ApiError, RequestTrace, SuccessResponse, UserActionError,
};
use volley_control::{CallSample, CircuitBreaker, MetricsAggregator};
use volley_store::{ContextStore, TerminalOutcome};

use crate::http::{attempt_timeout, ApiResponse, HttpExecute, OutboundRequest};
use crate::limiter::RateLimiter;
use crate::pool::{PoolTask, RecordProcessor, TaskOutcome};
use crate::retry::RetryDecision;

/// The record pipeline; one instance serves every pool worker.
pub struct RecordPipeline {
    http: Arc<dyn HttpExecute>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<ContextStore>,
    metrics: Arc<MetricsAggregator>,
}

/// What one attempt produced on the wire, kept apart from its
/// classification so the trace can be written on every path.
struct AttemptMeta {
    status: Option<u16>,
    response_headers: Value,
    response_body: Value,
    duration_ms: u64,
}

impl RecordPipeline {
    pub fn new(
        http: Arc<dyn HttpExecute>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<ContextStore>,
        metrics: Arc<MetricsAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            limiter,
            breaker,
            store,
            metrics,
        })
    }

    async fn attempt(
        &self,
        task: &PoolTask,
        attempt: u32,
    ) -> Result<(Result<ApiResponse, ApiError>, AttemptMeta), ApiError> {
        let request = OutboundRequest {
            url: task.context.api_url.clone(),
            method: "POST".into(),
            headers: task.context.headers.clone(),
            body: task.record.payload().clone(),
            timeout: attempt_timeout(attempt),
        };
        let permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => return Err(ApiError::system(format!("rate limiter unavailable: {}", e))),
        };
        let result = self.http.execute(&request).await;
        drop(permit);

        Ok(match result {
            Ok(response) => {
                let meta = AttemptMeta {
                    status: Some(response.status),
                    response_headers: json!(response.headers),
                    response_body: response.body.clone(),
                    duration_ms: response.duration_ms,
                };
                if response.status < 400 {
                    (Ok(response), meta)
                } else {
                    let error = volley_core::classify_response(
                        response.status,
                        &response.headers,
                        &response.body,
                    );
                    (Err(error), meta)
                }
            }
            Err(failure) => {
                let meta = AttemptMeta {
                    status: failure.status,
                    response_headers: json!(failure.headers),
                    response_body: failure.body.clone(),
                    duration_ms: failure.duration_ms,
                };
                (Err(failure.into_api_error()), meta)
            }
        })
    }

    async fn write_attempt_trace(
        &self,
        task: &PoolTask,
        request_id: &str,
        attempt: u32,
        meta: &AttemptMeta,
        error_message: Option<&str>,
        terminal: Option<TerminalOutcome>,
    ) {
        let session_id = &task.context.session_id;
        let base_trace_id = trace_id(session_id, request_id);
        let request_headers: HashMap<String, String> =
            task.context.headers.iter().cloned().collect();
        let trace = RequestTrace {
            trace_id: base_trace_id.clone(),
            ts: Utc::now(),
            url: task.context.api_url.clone(),
            method: "POST".into(),
            request_headers: json!(request_headers),
            request_body: task.record.payload().clone(),
            response_status: meta.status,
            response_headers: meta.response_headers.clone(),
            response_body: meta.response_body.clone(),
            success: error_message.is_none(),
            error_message: error_message.map(str::to_string),
            time_ms: meta.duration_ms,
            attempt,
            is_retry: attempt > 1,
            original_trace_id: (attempt > 1).then(|| base_trace_id.clone()),
        };
        if let Err(e) = self
            .store
            .record_trace(session_id, request_id, &trace, terminal)
            .await
        {
            tracing::error!(session_id = %session_id, request_id, attempt, error = %e, "trace write failed");
        }
    }

    async fn record_terminal_failure(&self, task: &PoolTask, error: &ApiError) {
        let context = &task.context;
        if error.user_action_required {
            let ts = Utc::now();
            let user_error = UserActionError {
                error_id: user_action_error_id(
                    &context.session_id,
                    &context.job_id,
                    ts.timestamp_millis(),
                ),
                session_id: context.session_id.clone(),
                job_id: context.job_id.clone(),
                ts,
                status_code: error.status_code,
                category: error.category,
                message: error.message.clone(),
                validation_errors: error.validation_errors.clone(),
                permission_info: error.permission_info.clone(),
                user_action_guidance: error.user_action_guidance.clone(),
                record: task.record.clone(),
                resolved: false,
                resolution: None,
                resolved_at: None,
            };
            if let Err(e) = self.store.record_user_action_error(&user_error).await {
                tracing::error!(error = %e, "user-action error write failed");
            }
        }
        let counts_against_endpoint = matches!(error.status_code, Some(429))
            || error.status_code.is_some_and(|status| status >= 500);
        if counts_against_endpoint {
            if let Err(e) = self
                .store
                .bump_record_error(&context.api_url, error.status_code, &error.message)
                .await
            {
                tracing::warn!(error = %e, "record-error bump failed");
            }
        }
    }

    async fn record_terminal_success(
        &self,
        task: &PoolTask,
        request_id: &str,
        response: &ApiResponse,
    ) {
        let context = &task.context;
        let ts = Utc::now();
        let success = SuccessResponse {
            response_id: format!(
                "{}:{}",
                trace_id(&context.session_id, request_id),
                ts.timestamp_millis()
            ),
            session_id: context.session_id.clone(),
            job_id: context.job_id.clone(),
            ts,
            status_code: response.status,
            headers: json!(response.headers),
            data: response.body.clone(),
            record: task.record.clone(),
            duration_ms: response.duration_ms,
        };
        if let Err(e) = self.store.record_success_response(&success).await {
            tracing::error!(error = %e, "success response write failed");
        }
    }

    async fn run(&self, task: PoolTask) -> TaskOutcome {
        let Some(request_id) = task.record.request_id().map(str::to_string) else {
            return TaskOutcome::failure(
                task.record.clone(),
                ApiError::system("record is missing requestId"),
            );
        };

        let mut attempt: u32 = 1;
        loop {
            // The gate applies per attempt: a trip mid-retry stops the next
            // attempt before it reaches the wire.
            if self.breaker.is_open() {
                return TaskOutcome::failure(
                    task.record.clone(),
                    ApiError::system("Circuit breaker active"),
                );
            }

            let (classified, meta) = match self.attempt(&task, attempt).await {
                Ok(outcome) => outcome,
                Err(error) => return TaskOutcome::failure(task.record.clone(), error),
            };

            self.metrics
                .observe(CallSample {
                    url: task.context.api_url.clone(),
                    status: meta.status,
                    duration_ms: meta.duration_ms,
                    success: classified.is_ok(),
                })
                .await;

            match classified {
                Ok(response) => {
                    self.write_attempt_trace(
                        &task,
                        &request_id,
                        attempt,
                        &meta,
                        None,
                        Some(TerminalOutcome {
                            success: true,
                            status: meta.status,
                        }),
                    )
                    .await;
                    self.record_terminal_success(&task, &request_id, &response)
                        .await;
                    if task.context.verbose {
                        self.store
                            .log(
                                &task.context.session_id,
                                json!({
                                    "event": "RECORD_OK",
                                    "requestId": request_id,
                                    "attempt": attempt,
                                    "status": response.status,
                                    "timeMs": response.duration_ms,
                                }),
                            )
                            .await;
                    }
                    return TaskOutcome::success(task.record.clone(), response.body);
                }
                Err(error) => {
                    let decision = task.context.retry.decide(&error, attempt);
                    let terminal = matches!(decision, RetryDecision::Fail);
                    self.write_attempt_trace(
                        &task,
                        &request_id,
                        attempt,
                        &meta,
                        Some(&error.message),
                        terminal.then_some(TerminalOutcome {
                            success: false,
                            status: meta.status,
                        }),
                    )
                    .await;
                    match decision {
                        RetryDecision::Fail => {
                            self.record_terminal_failure(&task, &error).await;
                            if task.context.verbose {
                                self.store
                                    .log(
                                        &task.context.session_id,
                                        json!({
                                            "event": "RECORD_FAILED",
                                            "requestId": request_id,
                                            "attempt": attempt,
                                            "category": error.category.as_str(),
                                            "message": error.message.clone(),
                                        }),
                                    )
                                    .await;
                            }
                            return TaskOutcome::failure(task.record.clone(), error);
                        }
                        RetryDecision::RetryAfter(delay) => {
                            tracing::debug!(
                                request_id = %request_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "retrying record"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RecordProcessor for RecordPipeline {
    async fn process(&self, task: PoolTask) -> TaskOutcome {
        self.run(task).await
    }
}
