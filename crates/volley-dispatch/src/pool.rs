//! Bounded worker pool.
//!
//! A fixed set of workers pulling from one shared unbounded FIFO: whichever
//! worker goes idle claims the next queued submission, so a slow task never
//! blocks work queued behind it while siblings sit free. Guarantees:
//! - every submission resolves with a [`TaskOutcome`], never hangs: a hard
//!   per-task timeout, crash detection, and a dedicated shutdown error
//!   cover the failure paths;
//! - a crashed worker is replaced by its supervisor; the task that was on
//!   the crashed worker surfaces as a system error to its submitter, and
//!   queued tasks stay in the shared queue for the survivors;
//! - a task that cannot be enqueued at all fails with a system error;
//! - [`WorkerPool::batch_process`] returns per-record results in input
//!   order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use volley_core::{ApiError, JobId, Record, SessionId};

use crate::retry::RetryConfig;

/// Task flavor; both run the record pipeline, `ApiCall` skips any local
/// record transformation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    ApiCall,
    ProcessRecord,
}

/// Everything a worker needs to run one record.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub api_url: String,
    pub headers: Vec<(String, String)>,
    pub retry: RetryConfig,
    pub verbose: bool,
}

/// One typed unit of pool work.
#[derive(Clone, Debug)]
pub struct PoolTask {
    pub kind: TaskKind,
    pub record: Record,
    pub context: TaskContext,
}

/// Per-record result, labelled for the batch worker's accounting.
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ApiError>,
    pub record: Record,
    pub user_action_required: bool,
}

impl TaskOutcome {
    pub fn success(record: Record, data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            record,
            user_action_required: false,
        }
    }

    pub fn failure(record: Record, error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            user_action_required: error.user_action_required,
            error: Some(error),
            record,
        }
    }
}

/// Executes one task; implemented by the record pipeline.
#[async_trait]
pub trait RecordProcessor: Send + Sync + 'static {
    async fn process(&self, task: PoolTask) -> TaskOutcome;
}

struct Submission {
    task: PoolTask,
    reply: oneshot::Sender<TaskOutcome>,
}

/// The shared submission queue end workers pull from. One worker at a time
/// waits in `recv`; the rest queue on the lock until it claims.
type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Submission>>>;

/// Pool size for this host: one less than the CPU count, kept within [2, 4].
pub fn pool_size_for_host() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).clamp(2, 4)
}

pub struct WorkerPool {
    sender: Mutex<mpsc::UnboundedSender<Submission>>,
    shutdown: Arc<AtomicBool>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    task_timeout: Duration,
    size: usize,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<dyn RecordProcessor>,
        pool_size: usize,
        task_timeout: Duration,
    ) -> Arc<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let supervisors = (0..pool_size)
            .map(|index| {
                supervise(
                    index,
                    queue.clone(),
                    processor.clone(),
                    task_timeout,
                    shutdown.clone(),
                )
            })
            .collect();
        Arc::new(Self {
            sender: Mutex::new(sender),
            shutdown,
            supervisors: Mutex::new(supervisors),
            task_timeout,
            size: pool_size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    fn shutdown_outcome(record: Record) -> TaskOutcome {
        TaskOutcome::failure(record, ApiError::system("worker pool shut down"))
    }

    fn sender(&self) -> mpsc::UnboundedSender<Submission> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submits one task and waits for its outcome. Never hangs: timeouts,
    /// crashes, and shutdown all resolve to failure outcomes.
    pub async fn submit(&self, task: PoolTask) -> TaskOutcome {
        let record = task.record.clone();
        if self.shutdown.load(Ordering::SeqCst) {
            return Self::shutdown_outcome(record);
        }
        let (reply, receiver) = oneshot::channel();
        if self.sender().send(Submission { task, reply }).is_err() {
            return TaskOutcome::failure(
                record,
                ApiError::system("task could not be delivered to the pool"),
            );
        }
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.shutdown.load(Ordering::SeqCst) {
                    Self::shutdown_outcome(record)
                } else {
                    TaskOutcome::failure(
                        record,
                        ApiError::system("worker crashed while processing task"),
                    )
                }
            }
        }
    }

    /// Submits all tasks and waits for every one to settle; results are in
    /// input order.
    pub async fn batch_process(&self, tasks: Vec<PoolTask>) -> Vec<TaskOutcome> {
        let submissions: Vec<_> = tasks.into_iter().map(|task| self.submit(task)).collect();
        futures::future::join_all(submissions).await
    }

    /// Rejects queued work with the shutdown error and stops all workers.
    /// In-flight tasks run to completion (bounded by the task timeout).
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            // Dropping the live sender closes the queue once drained; a
            // fresh dangling sender keeps late submitters on the fast-fail
            // path.
            let (dangling, _closed) = mpsc::unbounded_channel();
            *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = dangling;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut supervisors = self
                .supervisors
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            supervisors.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "pool supervisor ended abnormally");
            }
        }
    }
}

/// Supervisor: keeps one worker alive over the shared queue, replacing it
/// when it crashes. The queue itself survives crashes, so only the task
/// that was in flight is lost.
fn supervise(
    index: usize,
    queue: SharedQueue,
    processor: Arc<dyn RecordProcessor>,
    task_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let worker = tokio::spawn(worker_loop(
                index,
                queue.clone(),
                processor.clone(),
                task_timeout,
                shutdown.clone(),
            ));
            match worker.await {
                Ok(()) => break,
                Err(e) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::warn!(worker = index, error = %e, "pool worker crashed; replacing");
                }
            }
        }
    })
}

async fn worker_loop(
    index: usize,
    queue: SharedQueue,
    processor: Arc<dyn RecordProcessor>,
    task_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let claimed = {
            let mut receiver = queue.lock().await;
            receiver.recv().await
        };
        let Some(submission) = claimed else {
            break;
        };
        if shutdown.load(Ordering::SeqCst) {
            let record = submission.task.record.clone();
            let _ = submission.reply.send(WorkerPool::shutdown_outcome(record));
            continue;
        }
        let record = submission.task.record.clone();
        let outcome = match tokio::time::timeout(task_timeout, processor.process(submission.task))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(worker = index, "pool task exceeded hard timeout");
                TaskOutcome::failure(
                    record,
                    ApiError::system(format!(
                        "task timed out after {}s",
                        task_timeout.as_secs()
                    )),
                )
            }
        };
        let _ = submission.reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use volley_core::ErrorCategory;

    fn task(request_id: &str) -> PoolTask {
        PoolTask {
            kind: TaskKind::ApiCall,
            record: Record::new(json!({"memberId": "M1", "requestId": request_id})),
            context: TaskContext {
                session_id: "S1".into(),
                job_id: "J1".into(),
                api_url: "http://api/echo".into(),
                headers: Vec::new(),
                retry: RetryConfig::default(),
                verbose: false,
            },
        }
    }

    /// Succeeds normally; panics on records whose requestId is "boom";
    /// stalls forever on "stall".
    struct ScriptedProcessor;

    #[async_trait]
    impl RecordProcessor for ScriptedProcessor {
        async fn process(&self, task: PoolTask) -> TaskOutcome {
            match task.record.request_id() {
                Some("boom") => panic!("scripted worker crash"),
                Some("stall") => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                _ => TaskOutcome::success(task.record, json!({"ok": true})),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_results_preserve_input_order() {
        let pool = WorkerPool::new(Arc::new(ScriptedProcessor), 3, Duration::from_secs(30));
        let tasks: Vec<PoolTask> = (0..7).map(|i| task(&format!("R{}", i))).collect();
        let outcomes = pool.batch_process(tasks).await;
        assert_eq!(outcomes.len(), 7);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert!(outcome.success);
            assert_eq!(outcome.record.request_id(), Some(format!("R{}", i)).as_deref());
        }
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_is_replaced_and_task_errors() {
        let pool = WorkerPool::new(Arc::new(ScriptedProcessor), 3, Duration::from_secs(30));
        let outcome = pool.submit(task("boom")).await;
        assert!(!outcome.success);
        let error = outcome.error.expect("error");
        assert_eq!(error.category, ErrorCategory::SystemError);
        assert!(error.message.contains("crashed"));

        // The pool keeps serving from the shared queue.
        for i in 0..6 {
            let outcome = pool.submit(task(&format!("after-{}", i))).await;
            assert!(outcome.success, "submission {} after crash", i);
        }
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_pull_past_a_stalled_sibling() {
        let pool = WorkerPool::new(Arc::new(ScriptedProcessor), 2, Duration::from_secs(30));
        let stalled = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(task("stall")).await }
        });
        // Let the stalled task get claimed by one worker.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = tokio::time::Instant::now();
        for i in 0..4 {
            let outcome = pool.submit(task(&format!("quick-{}", i))).await;
            assert!(outcome.success, "quick task {} must not queue behind the stall", i);
        }
        assert!(
            start.elapsed() < Duration::from_secs(30),
            "idle worker must serve queued tasks before the stall times out"
        );

        let stalled_outcome = stalled.await.expect("join");
        assert!(!stalled_outcome.success);
        assert!(stalled_outcome
            .error
            .expect("error")
            .message
            .contains("timed out"));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_task_hits_hard_timeout() {
        let pool = WorkerPool::new(Arc::new(ScriptedProcessor), 2, Duration::from_secs(30));
        let outcome = pool.submit(task("stall")).await;
        assert!(!outcome.success);
        assert!(outcome
            .error
            .expect("error")
            .message
            .contains("timed out after 30s"));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_submissions() {
        let pool = WorkerPool::new(Arc::new(ScriptedProcessor), 2, Duration::from_secs(30));
        pool.shutdown().await;
        let outcome = pool.submit(task("R1")).await;
        assert!(!outcome.success);
        assert!(outcome
            .error
            .expect("error")
            .message
            .contains("shut down"));
    }
}
