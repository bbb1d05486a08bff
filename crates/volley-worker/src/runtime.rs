//! Runtime assembly: wires the store, limiter, pool, pipeline, metrics,
//! controller, and job consumers into one running dispatcher.
//!
//! The controller owns the job-handler width; the consumer loop honors it
//! through a shared atomic, which is what "recreate the batch worker at the
//! new width" amounts to here: the fan-out resizes without dropping
//! in-flight jobs. Shutdown is graceful: stop dequeuing, drain in-flight
//! jobs up to the pool task timeout, then terminate the pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use volley_core::{DispatchConfig, Result, WorkerId};
use volley_control::{
    AdaptiveController, BacklogProbe, CircuitBreaker, ConcurrencyActuator, HostProbe,
    MetricsAggregator, SysinfoProbe,
};
use volley_dispatch::{
    pool_size_for_host, HttpExecute, RateLimiter, RateLimiterConfig, RecordPipeline, WorkerPool,
};
use volley_store::{ContextStore, KvStore, StoreLogSink};

use crate::queue::JobQueue;
use crate::worker::BatchWorker;

/// Installs the global tracing subscriber (env-filtered). Call once from
/// the binary entry point.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Assembly knobs that are host decisions rather than engine tuning.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub worker_id: WorkerId,
    pub limiter: RateLimiterConfig,
    /// Overrides the CPU-derived pool size (tests).
    pub pool_size: Option<usize>,
    pub queue_poll_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_id: format!("volley-{}", std::process::id()),
            limiter: RateLimiterConfig::default(),
            pool_size: None,
            queue_poll_interval: Duration::from_millis(500),
        }
    }
}

struct QueueBacklog {
    queue: Arc<dyn JobQueue>,
}

#[async_trait]
impl BacklogProbe for QueueBacklog {
    async fn waiting_jobs(&self) -> usize {
        self.queue
            .count_by_state(volley_core::JobState::Waiting)
            .await
            .unwrap_or(0)
    }
}

/// Applies controller actions: resizes the consumer fan-out and retunes
/// (then publishes) the rate limiter.
struct RuntimeActuator {
    width: Arc<AtomicUsize>,
    limiter: Arc<RateLimiter>,
    store: Arc<ContextStore>,
}

#[async_trait]
impl ConcurrencyActuator for RuntimeActuator {
    async fn apply_concurrency(&self, width: usize) {
        let previous = self.width.swap(width, Ordering::SeqCst);
        if previous != width {
            tracing::info!(previous, width, "job-handler concurrency resized");
        }
    }

    async fn autotune_limiter(&self, error_rate: f64, avg_response_ms: f64) {
        let snapshot = self.limiter.tune(error_rate, avg_response_ms);
        if let Err(e) = self
            .store
            .publish_rate_limiter(
                snapshot.max_concurrent,
                snapshot.min_time_ms,
                error_rate,
                avg_response_ms,
            )
            .await
        {
            tracing::warn!(error = %e, "rate limiter settings publish failed");
        }
    }
}

/// A fully wired dispatcher.
pub struct DispatcherRuntime {
    config: DispatchConfig,
    store: Arc<ContextStore>,
    pool: Arc<WorkerPool>,
    batch_worker: Arc<BatchWorker>,
    controller: Arc<AdaptiveController>,
    width: Arc<AtomicUsize>,
    active_jobs: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatcherRuntime {
    /// Builds every component and starts the controller and job consumer.
    pub async fn start(
        config: DispatchConfig,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn JobQueue>,
        http: Arc<dyn HttpExecute>,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>> {
        Self::start_with_host_probe(config, kv, queue, http, options, Arc::new(SysinfoProbe::new()))
            .await
    }

    /// Like [`DispatcherRuntime::start`] with an explicit host probe (tests
    /// feed synthetic load).
    pub async fn start_with_host_probe(
        config: DispatchConfig,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn JobQueue>,
        http: Arc<dyn HttpExecute>,
        options: RuntimeOptions,
        host: Arc<dyn HostProbe>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(ContextStore::new(kv.clone(), config.session_ttl));
        store.set_log_sink(Arc::new(StoreLogSink::new(kv)));

        let metrics = Arc::new(MetricsAggregator::new(store.clone(), config.error_window));
        let breaker = Arc::new(CircuitBreaker::new(config.cb_reset_timeout));
        let limiter = RateLimiter::new(options.limiter.clone());
        let pipeline = RecordPipeline::new(
            http,
            limiter.clone(),
            breaker.clone(),
            store.clone(),
            metrics.clone(),
        );
        let pool_size = options.pool_size.unwrap_or_else(pool_size_for_host);
        let pool = WorkerPool::new(pipeline.clone(), pool_size, config.pool_task_timeout);

        let width = Arc::new(AtomicUsize::new(config.min_concurrency));
        let actuator = Arc::new(RuntimeActuator {
            width: width.clone(),
            limiter,
            store: store.clone(),
        });
        let controller = Arc::new(AdaptiveController::new(
            config.clone(),
            metrics,
            store.clone(),
            breaker,
            host,
            Arc::new(QueueBacklog {
                queue: queue.clone(),
            }),
            actuator,
        ));

        let batch_worker = BatchWorker::new(
            options.worker_id.clone(),
            store.clone(),
            pool.clone(),
            pipeline,
            queue.clone(),
            controller.clone(),
        );

        let runtime = Arc::new(Self {
            config,
            store,
            pool,
            batch_worker: batch_worker.clone(),
            controller: controller.clone(),
            width: width.clone(),
            active_jobs: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = vec![controller.spawn()];
        handles.push(runtime.clone().spawn_consumer(queue, options.queue_poll_interval));
        *runtime
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;
        Ok(runtime)
    }

    pub fn store(&self) -> Arc<ContextStore> {
        self.store.clone()
    }

    pub fn controller(&self) -> Arc<AdaptiveController> {
        self.controller.clone()
    }

    pub fn batch_worker(&self) -> Arc<BatchWorker> {
        self.batch_worker.clone()
    }

    /// Current job-handler width (controller-owned).
    pub fn concurrency(&self) -> usize {
        self.width.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    fn spawn_consumer(
        self: Arc<Self>,
        queue: Arc<dyn JobQueue>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                if self.active_jobs.load(Ordering::SeqCst) >= self.width.load(Ordering::SeqCst) {
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
                match queue.next_job().await {
                    Ok(Some(job)) => {
                        self.active_jobs.fetch_add(1, Ordering::SeqCst);
                        let worker = self.batch_worker.clone();
                        let active = self.active_jobs.clone();
                        tokio::spawn(async move {
                            let verdict = worker.process_job(&job).await;
                            tracing::debug!(job_id = %job.job_id, ?verdict, "job finished");
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Ok(None) => tokio::time::sleep(poll_interval).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "queue poll failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        })
    }

    /// Graceful drain: stop dequeuing, wait for in-flight jobs up to the
    /// pool task timeout, then terminate the pool and the control loops.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.config.pool_task_timeout;
        while self.active_jobs.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.pool.shutdown().await;
        let handles: Vec<JoinHandle<()>> = {
            let mut held = self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            held.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
        tracing::info!("dispatcher drained and stopped");
    }

    /// Runs until SIGTERM/ctrl-c, then drains.
    pub async fn run_until_shutdown(&self) {
        wait_for_termination().await;
        tracing::info!("termination signal received; draining");
        self.shutdown().await;
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "SIGTERM handler unavailable; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
