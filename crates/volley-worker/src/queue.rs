//! Job queue contract and the in-memory reference queue.
//!
//! The engine assumes a standard job-queue: add, fetch, counts, ranged
//! listing, progress updates, delay/promote/remove, pause/resume, and
//! native retry with exponential backoff on failure. [`MemoryQueue`]
//! documents those semantics and backs the tests; production deployments
//! plug a real queue in behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use volley_core::{DispatchError, JobId, JobProgress, JobSpec, JobState, Result};

/// Per-job queue options.
#[derive(Clone, Debug)]
pub struct JobOptions {
    /// Total processing attempts before the job lands in `failed`.
    pub attempts: u32,
    /// Base for the exponential retry backoff.
    pub backoff_base: Duration,
    /// Completed jobs retained: at most this many.
    pub keep_completed: usize,
    /// Completed jobs retained: at most this long.
    pub completed_ttl: Duration,
    /// Failed jobs retained this long.
    pub failed_ttl: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            keep_completed: 1000,
            completed_ttl: Duration::from_secs(24 * 60 * 60),
            failed_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// A job with its queue-side bookkeeping.
#[derive(Clone, Debug)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub name: String,
    pub spec: JobSpec,
    pub state: JobState,
    pub attempts_made: u32,
    pub progress: Option<JobProgress>,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
}

/// Standard job-queue contract consumed by the batch worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job; `None` options take the queue defaults.
    async fn add(&self, name: &str, spec: JobSpec, opts: Option<JobOptions>) -> Result<JobId>;

    /// Claims the next runnable job (promoting due delayed jobs first).
    /// Returns `None` when the queue is empty or paused.
    async fn next_job(&self) -> Result<Option<QueuedJob>>;

    async fn get_job(&self, job_id: &JobId) -> Result<Option<QueuedJob>>;

    async fn count_by_state(&self, state: JobState) -> Result<usize>;

    /// Jobs in the given states, newest first, over the `[from, to]` index
    /// range.
    async fn jobs(&self, states: &[JobState], from: usize, to: usize) -> Result<Vec<QueuedJob>>;

    async fn update_progress(&self, job_id: &JobId, progress: JobProgress) -> Result<()>;

    async fn complete(&self, job_id: &JobId, return_value: Value) -> Result<()>;

    /// Fails one attempt: requeues with backoff while attempts remain,
    /// otherwise moves the job to `failed`.
    async fn fail(&self, job_id: &JobId, reason: String) -> Result<()>;

    /// Moves the job straight to `failed`; no retry. For precondition
    /// violations (invalid records, missing session).
    async fn fail_permanently(&self, job_id: &JobId, reason: String) -> Result<()>;

    async fn move_to_delayed(&self, job_id: &JobId, until: DateTime<Utc>) -> Result<()>;

    /// Promotes a delayed job to waiting immediately.
    async fn promote(&self, job_id: &JobId) -> Result<()>;

    async fn remove(&self, job_id: &JobId) -> Result<bool>;

    async fn pause(&self);

    async fn resume(&self);
}

struct QueueInner {
    jobs: HashMap<JobId, QueuedJob>,
    options: HashMap<JobId, JobOptions>,
    waiting: VecDeque<JobId>,
    completed_order: VecDeque<JobId>,
    paused: bool,
    next_seq: u64,
}

/// In-memory queue with the contract's retry and retention semantics.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    defaults: JobOptions,
}

impl MemoryQueue {
    pub fn new(defaults: JobOptions) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                options: HashMap::new(),
                waiting: VecDeque::new(),
                completed_order: VecDeque::new(),
                paused: false,
                next_seq: 1,
            }),
            defaults,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn promote_due(inner: &mut QueueInner, now: DateTime<Utc>) {
        let due: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Delayed
                    && job.delay_until.map_or(true, |until| until <= now)
            })
            .map(|job| job.job_id.clone())
            .collect();
        for job_id in due {
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.state = JobState::Waiting;
                job.delay_until = None;
                inner.waiting.push_back(job_id);
            }
        }
    }

    fn trim_retention(inner: &mut QueueInner, now: DateTime<Utc>) {
        // Count-based retention for completed jobs.
        let keep = inner
            .completed_order
            .iter()
            .filter_map(|id| inner.options.get(id))
            .map(|opts| opts.keep_completed)
            .next()
            .unwrap_or(1000);
        while inner.completed_order.len() > keep {
            if let Some(evicted) = inner.completed_order.pop_front() {
                inner.jobs.remove(&evicted);
                inner.options.remove(&evicted);
            }
        }
        // Age-based retention for completed and failed jobs.
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| {
                let Some(finished) = job.finished_at else {
                    return false;
                };
                let Some(opts) = inner.options.get(&job.job_id) else {
                    return false;
                };
                let ttl = match job.state {
                    JobState::Completed => opts.completed_ttl,
                    JobState::Failed => opts.failed_ttl,
                    _ => return false,
                };
                now.signed_duration_since(finished).num_milliseconds()
                    > ttl.as_millis() as i64
            })
            .map(|job| job.job_id.clone())
            .collect();
        for job_id in expired {
            inner.jobs.remove(&job_id);
            inner.options.remove(&job_id);
            inner.completed_order.retain(|id| *id != job_id);
        }
    }

    fn with_job<T>(
        &self,
        job_id: &JobId,
        apply: impl FnOnce(&mut QueueInner, &JobId) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(job_id) {
            return Err(DispatchError::Queue(format!("no such job: {}", job_id)));
        }
        apply(&mut inner, job_id)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(JobOptions::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn add(&self, name: &str, spec: JobSpec, opts: Option<JobOptions>) -> Result<JobId> {
        let mut inner = self.lock();
        let job_id = format!("job-{}", inner.next_seq);
        inner.next_seq += 1;
        let job = QueuedJob {
            job_id: job_id.clone(),
            name: name.to_string(),
            spec,
            state: JobState::Waiting,
            attempts_made: 0,
            progress: None,
            return_value: None,
            failed_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            delay_until: None,
        };
        inner.jobs.insert(job_id.clone(), job);
        inner
            .options
            .insert(job_id.clone(), opts.unwrap_or_else(|| self.defaults.clone()));
        inner.waiting.push_back(job_id.clone());
        Ok(job_id)
    }

    async fn next_job(&self) -> Result<Option<QueuedJob>> {
        let mut inner = self.lock();
        let now = Utc::now();
        Self::promote_due(&mut inner, now);
        if inner.paused {
            return Ok(None);
        }
        let Some(job_id) = inner.waiting.pop_front() else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<QueuedJob>> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn count_by_state(&self, state: JobState) -> Result<usize> {
        let mut inner = self.lock();
        Self::promote_due(&mut inner, Utc::now());
        Ok(inner.jobs.values().filter(|job| job.state == state).count())
    }

    async fn jobs(&self, states: &[JobState], from: usize, to: usize) -> Result<Vec<QueuedJob>> {
        let inner = self.lock();
        let mut matched: Vec<QueuedJob> = inner
            .jobs
            .values()
            .filter(|job| states.contains(&job.state))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if from >= matched.len() {
            return Ok(Vec::new());
        }
        let to = to.min(matched.len().saturating_sub(1));
        Ok(matched[from..=to].to_vec())
    }

    async fn update_progress(&self, job_id: &JobId, progress: JobProgress) -> Result<()> {
        self.with_job(job_id, |inner, job_id| {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.progress = Some(progress);
            }
            Ok(())
        })
    }

    async fn complete(&self, job_id: &JobId, return_value: Value) -> Result<()> {
        self.with_job(job_id, |inner, job_id| {
            let now = Utc::now();
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.state = JobState::Completed;
                job.return_value = Some(return_value);
                job.finished_at = Some(now);
            }
            inner.completed_order.push_back(job_id.clone());
            Self::trim_retention(inner, now);
            Ok(())
        })
    }

    async fn fail(&self, job_id: &JobId, reason: String) -> Result<()> {
        self.with_job(job_id, |inner, job_id| {
            let now = Utc::now();
            let attempts_allowed = inner
                .options
                .get(job_id)
                .map(|opts| opts.attempts)
                .unwrap_or(3);
            let backoff_base = inner
                .options
                .get(job_id)
                .map(|opts| opts.backoff_base)
                .unwrap_or(Duration::from_secs(5));
            if let Some(job) = inner.jobs.get_mut(job_id) {
                if job.attempts_made < attempts_allowed {
                    let exponent = job.attempts_made.saturating_sub(1);
                    let delay = backoff_base * 2u32.saturating_pow(exponent);
                    job.state = JobState::Delayed;
                    job.failed_reason = Some(reason);
                    job.delay_until = now
                        .checked_add_signed(chrono::Duration::milliseconds(
                            delay.as_millis() as i64
                        ));
                } else {
                    job.state = JobState::Failed;
                    job.failed_reason = Some(reason);
                    job.finished_at = Some(now);
                }
            }
            Self::trim_retention(inner, now);
            Ok(())
        })
    }

    async fn fail_permanently(&self, job_id: &JobId, reason: String) -> Result<()> {
        self.with_job(job_id, |inner, job_id| {
            let now = Utc::now();
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.state = JobState::Failed;
                job.failed_reason = Some(reason);
                job.finished_at = Some(now);
            }
            Self::trim_retention(inner, now);
            Ok(())
        })
    }

    async fn move_to_delayed(&self, job_id: &JobId, until: DateTime<Utc>) -> Result<()> {
        self.with_job(job_id, |inner, job_id| {
            inner.waiting.retain(|id| id != job_id);
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.state = JobState::Delayed;
                job.delay_until = Some(until);
            }
            Ok(())
        })
    }

    async fn promote(&self, job_id: &JobId) -> Result<()> {
        self.with_job(job_id, |inner, job_id| {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                if job.state == JobState::Delayed {
                    job.state = JobState::Waiting;
                    job.delay_until = None;
                    inner.waiting.push_back(job_id.clone());
                }
            }
            Ok(())
        })
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool> {
        let mut inner = self.lock();
        inner.waiting.retain(|id| id != job_id);
        inner.completed_order.retain(|id| id != job_id);
        inner.options.remove(job_id);
        Ok(inner.jobs.remove(job_id).is_some())
    }

    async fn pause(&self) {
        self.lock().paused = true;
    }

    async fn resume(&self) {
        self.lock().paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use volley_core::Record;

    fn spec() -> JobSpec {
        JobSpec {
            session_id: "S1".into(),
            records: vec![Record::new(json!({"memberId": "M1", "requestId": "R1"}))],
            verbose: false,
        }
    }

    #[tokio::test]
    async fn add_claim_complete_lifecycle() {
        let queue = MemoryQueue::default();
        let job_id = queue.add("batch", spec(), None).await.expect("add");
        assert_eq!(queue.count_by_state(JobState::Waiting).await.expect("count"), 1);

        let job = queue.next_job().await.expect("next").expect("job");
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(queue.next_job().await.expect("next").is_none());

        queue
            .complete(&job_id, json!({"successCount": 1}))
            .await
            .expect("complete");
        let done = queue.get_job(&job_id).await.expect("get").expect("job");
        assert_eq!(done.state, JobState::Completed);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn fail_requeues_with_backoff_until_attempts_exhaust() {
        let queue = MemoryQueue::default();
        let job_id = queue.add("batch", spec(), None).await.expect("add");

        for attempt in 1..=3u32 {
            // Delayed jobs promote once due; force-promote to skip waiting.
            queue.promote(&job_id).await.expect("promote");
            let job = queue.next_job().await.expect("next").expect("job");
            assert_eq!(job.attempts_made, attempt);
            queue
                .fail(&job_id, format!("boom {}", attempt))
                .await
                .expect("fail");
        }

        let job = queue.get_job(&job_id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed, "attempts exhausted");
        assert_eq!(job.failed_reason.as_deref(), Some("boom 3"));
    }

    #[tokio::test]
    async fn fail_permanently_skips_retries() {
        let queue = MemoryQueue::default();
        let job_id = queue.add("batch", spec(), None).await.expect("add");
        queue.next_job().await.expect("next").expect("job");
        queue
            .fail_permanently(&job_id, "No config found".into())
            .await
            .expect("fail");
        let job = queue.get_job(&job_id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn pause_blocks_claims_until_resume() {
        let queue = MemoryQueue::default();
        queue.add("batch", spec(), None).await.expect("add");
        queue.pause().await;
        assert!(queue.next_job().await.expect("next").is_none());
        queue.resume().await;
        assert!(queue.next_job().await.expect("next").is_some());
    }

    #[tokio::test]
    async fn delayed_jobs_promote_when_due() {
        let queue = MemoryQueue::default();
        let job_id = queue.add("batch", spec(), None).await.expect("add");
        queue
            .move_to_delayed(&job_id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .expect("delay");
        // Already due: the next claim promotes and serves it.
        let job = queue.next_job().await.expect("next").expect("job");
        assert_eq!(job.job_id, job_id);
    }

    #[tokio::test]
    async fn completed_retention_keeps_last_n() {
        let queue = MemoryQueue::new(JobOptions {
            keep_completed: 2,
            ..JobOptions::default()
        });
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = queue.add("batch", spec(), None).await.expect("add");
            queue.next_job().await.expect("next").expect("job");
            queue.complete(&id, json!({})).await.expect("complete");
            ids.push(id);
        }
        assert!(queue.get_job(&ids[0]).await.expect("get").is_none());
        assert!(queue.get_job(&ids[1]).await.expect("get").is_none());
        assert!(queue.get_job(&ids[3]).await.expect("get").is_some());
    }
}
