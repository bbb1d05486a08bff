//! Adaptive concurrency controller.
//!
//! Runs on its own timer. Each tick folds host load, memory pressure, the
//! API error fraction, queue backlog, and response-time drift into moving
//! windows, scores the system's health from their trends, and takes at most
//! one action: trip the circuit breaker, walk recovery, raise or lower the
//! job-handler width, or apply the hour-of-day predictive nudge. The width
//! invariant `min <= C <= max` holds across every path.
//!
//! One deliberate softening of the health gate: a system whose signals are
//! flat *and* healthy scores a neutral trend (health 0), which still
//! qualifies for Increase as long as no adverse trend exists. Without it a
//! steady backlog under a healthy host would never scale up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use serde_json::json;
use tokio::time::Instant;
use volley_core::DispatchConfig;
use volley_store::ContextStore;

use crate::breaker::CircuitBreaker;
use crate::metrics::MetricsAggregator;
use crate::prediction::HourlyPattern;
use crate::signals::{HostProbe, MovingWindow, TrendWindow};

const CONCURRENCY_INCREASE_RATE: usize = 2;
const CONCURRENCY_STABILITY_THRESHOLD: u32 = 5;
const MAX_DECREASE_STEP: u32 = 3;
const MAX_RECOVERY_STEPS: u32 = 5;
/// Error-fraction signal window, in minute buckets.
const ERROR_FRACTION_MINUTES: usize = 5;

/// Receiver of controller actions: resizes the job-handler fan-out and
/// retunes the rate limiter. Implemented by the runtime assembly.
#[async_trait]
pub trait ConcurrencyActuator: Send + Sync {
    async fn apply_concurrency(&self, width: usize);
    async fn autotune_limiter(&self, error_rate: f64, avg_response_ms: f64);
}

/// Source of the queue-backlog signal.
#[async_trait]
pub trait BacklogProbe: Send + Sync {
    async fn waiting_jobs(&self) -> usize;
}

/// One tick's input signals. Produced by [`AdaptiveController::tick`];
/// tests feed synthetic samples through [`AdaptiveController::tick_with`].
#[derive(Clone, Copy, Debug)]
pub struct ControlSample {
    pub cpu_load: f64,
    pub mem_free_ratio: f64,
    pub error_fraction: f64,
    pub backlog: usize,
    pub avg_response_ms: f64,
    pub hour: usize,
}

/// The single action taken by one tick.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlDecision {
    /// Breaker is open; everything else is skipped.
    BreakerHeld,
    Tripped { reason: String },
    /// Breaker reset elapsed; concurrency dropped to min, recovery begins.
    RecoveryStarted,
    RecoveryStep { to: usize, finished: bool },
    Increased { to: usize, by: usize },
    Decreased { to: usize, by: usize },
    /// Hour-of-day nudge applied during a stable tick.
    Predictive { to: usize, delta: i64 },
    Stable,
    /// A change happened too recently; holding.
    Cooldown,
}

/// Snapshot for progress reports and worker metrics.
#[derive(Clone, Debug)]
pub struct ControllerStatus {
    pub concurrency: usize,
    pub status: String,
    pub system_health: f64,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub avg_error: f64,
    pub avg_backlog: f64,
    pub avg_response_ms: f64,
    pub breaker_active: bool,
    pub recovery_active: bool,
}

struct Recovery {
    target: usize,
    step: usize,
    steps_done: u32,
}

struct ControllerState {
    concurrency: usize,
    cpu: MovingWindow,
    mem: MovingWindow,
    error: MovingWindow,
    backlog: MovingWindow,
    response: MovingWindow,
    cpu_trend: TrendWindow,
    error_trend: TrendWindow,
    backlog_trend: TrendWindow,
    response_trend: TrendWindow,
    health_history: VecDeque<f64>,
    stability_counter: u32,
    consecutive_decrease: u32,
    last_change: Option<Instant>,
    last_avg_response: f64,
    recovery: Option<Recovery>,
    pattern: HourlyPattern,
    last_pattern_update: Option<Instant>,
    tick_count: u64,
    last_status: String,
    last_health: f64,
}

/// What a tick decided to do, carried out of the state lock.
struct Actions {
    apply_width: Option<usize>,
    trip: Option<(String, serde_json::Value)>,
    autotune: Option<(f64, f64)>,
}

pub struct AdaptiveController {
    config: DispatchConfig,
    metrics: Arc<MetricsAggregator>,
    store: Arc<ContextStore>,
    breaker: Arc<CircuitBreaker>,
    host: Arc<dyn HostProbe>,
    backlog: Arc<dyn BacklogProbe>,
    actuator: Arc<dyn ConcurrencyActuator>,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    pub fn new(
        config: DispatchConfig,
        metrics: Arc<MetricsAggregator>,
        store: Arc<ContextStore>,
        breaker: Arc<CircuitBreaker>,
        host: Arc<dyn HostProbe>,
        backlog: Arc<dyn BacklogProbe>,
        actuator: Arc<dyn ConcurrencyActuator>,
    ) -> Self {
        let state = ControllerState {
            concurrency: config.min_concurrency,
            cpu: MovingWindow::new(config.history_length),
            mem: MovingWindow::new(config.history_length),
            error: MovingWindow::new(config.history_length),
            backlog: MovingWindow::new(config.history_length),
            response: MovingWindow::new(config.history_length),
            cpu_trend: TrendWindow::new(config.trend_history_length),
            error_trend: TrendWindow::new(config.trend_history_length),
            backlog_trend: TrendWindow::new(config.trend_history_length),
            response_trend: TrendWindow::new(config.trend_history_length),
            health_history: VecDeque::with_capacity(config.system_health_history),
            stability_counter: 0,
            consecutive_decrease: 0,
            last_change: None,
            last_avg_response: 0.0,
            recovery: None,
            pattern: HourlyPattern::new(),
            last_pattern_update: None,
            tick_count: 0,
            last_status: "stable".into(),
            last_health: 0.0,
        };
        Self {
            config,
            metrics,
            store,
            breaker,
            host,
            backlog,
            actuator,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn concurrency(&self) -> usize {
        self.lock().concurrency
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.lock();
        ControllerStatus {
            concurrency: state.concurrency,
            status: state.last_status.clone(),
            system_health: state.last_health,
            avg_cpu: state.cpu.average(),
            avg_mem: state.mem.average(),
            avg_error: state.error.average(),
            avg_backlog: state.backlog.average(),
            avg_response_ms: state.response.average(),
            breaker_active: self.breaker.is_open(),
            recovery_active: state.recovery.is_some(),
        }
    }

    /// Gathers live signals and runs one tick.
    pub async fn tick(&self) -> ControlDecision {
        let host = self.host.sample();
        let backlog = self.backlog.waiting_jobs().await;
        let sample = ControlSample {
            cpu_load: host.cpu_load,
            mem_free_ratio: host.mem_free_ratio,
            error_fraction: self.metrics.error_fraction(ERROR_FRACTION_MINUTES),
            backlog,
            avg_response_ms: self.metrics.avg_response_time(),
            hour: Utc::now().hour() as usize,
        };
        self.tick_with(sample).await
    }

    /// Runs one tick against an explicit sample.
    pub async fn tick_with(&self, sample: ControlSample) -> ControlDecision {
        let now = Instant::now();
        let (decision, actions) = {
            let mut state = self.lock();
            self.decide(&mut state, sample, now)
        };

        if let Some((reason, snapshot)) = actions.trip {
            let record = self.breaker.trip(reason.clone(), snapshot);
            tracing::warn!(reason = %record.reason, "circuit breaker tripped");
            if let Err(e) = self.store.publish_circuit_breaker(&record).await {
                tracing::warn!(error = %e, "failed to mirror circuit breaker trip");
            }
        }
        if let Some(width) = actions.apply_width {
            self.actuator.apply_concurrency(width).await;
        }
        if let Some((error_rate, avg_response)) = actions.autotune {
            self.actuator.autotune_limiter(error_rate, avg_response).await;
        }
        if let Err(e) = self.metrics.publish().await {
            tracing::warn!(error = %e, "metrics publish failed");
        }
        decision
    }

    /// Pure decision step over the locked state. At most one action per tick.
    fn decide(
        &self,
        state: &mut ControllerState,
        sample: ControlSample,
        now: Instant,
    ) -> (ControlDecision, Actions) {
        state.tick_count += 1;
        state.cpu.push(sample.cpu_load);
        state.mem.push(sample.mem_free_ratio);
        state.error.push(sample.error_fraction);
        state.backlog.push(sample.backlog as f64);
        state.response.push(sample.avg_response_ms);
        state.cpu_trend.observe(&state.cpu);
        state.error_trend.observe(&state.error);
        state.backlog_trend.observe(&state.backlog);
        state.response_trend.observe(&state.response);

        let cpu_trend = state.cpu_trend.score();
        let error_trend = state.error_trend.score();
        let backlog_trend = state.backlog_trend.score();
        let response_trend = state.response_trend.score();
        let health = 0.3 * (-cpu_trend) + 0.3 * (-error_trend) + 0.2 * backlog_trend
            + 0.2 * (-response_trend);
        state.health_history.push_back(health);
        if state.health_history.len() > self.config.system_health_history {
            state.health_history.pop_front();
        }
        state.last_health = health;

        let avg_cpu = state.cpu.average();
        let avg_mem = state.mem.average();
        let avg_error = state.error.average();
        let avg_backlog = state.backlog.average();
        let avg_response = state.response.average();
        let previous_avg_response = state.last_avg_response;
        state.last_avg_response = avg_response;

        let min = self.config.min_concurrency;
        let max = self.config.max_concurrency;

        // Hour-of-day learning, throttled to the prediction interval; only
        // samples taken while healthy and above the band midpoint count.
        let pattern_due = state
            .last_pattern_update
            .map_or(true, |at| now.duration_since(at) >= self.config.prediction_update_interval);
        if pattern_due {
            state.last_pattern_update = Some(now);
            if health > 0.0 && state.concurrency > self.config.concurrency_midpoint() {
                state.pattern.record(sample.hour, state.concurrency);
            }
        }

        let mut actions = Actions {
            apply_width: None,
            trip: None,
            autotune: None,
        };
        // Limiter retune rides every other tick (~60s at the default cadence).
        if state.tick_count % 2 == 0 {
            actions.autotune = Some((avg_error, avg_response));
        }

        if self.breaker.is_open() {
            state.last_status = "breaker".into();
            return (ControlDecision::BreakerHeld, actions);
        }

        if self.breaker.has_elapsed() {
            self.breaker.clear();
            let target = self.config.recovery_target();
            let span = target.saturating_sub(min);
            let step = (span.div_ceil(MAX_RECOVERY_STEPS as usize)).max(1);
            state.concurrency = min;
            state.recovery = Some(Recovery {
                target,
                step,
                steps_done: 0,
            });
            state.stability_counter = 0;
            state.consecutive_decrease = 0;
            state.last_change = Some(now);
            state.last_status = "recovery".into();
            actions.apply_width = Some(min);
            return (ControlDecision::RecoveryStarted, actions);
        }

        if avg_error > self.config.cb_error_threshold || health < -0.7 {
            let reason = if avg_error > self.config.cb_error_threshold {
                format!(
                    "error rate {:.2} over threshold {:.2}",
                    avg_error, self.config.cb_error_threshold
                )
            } else {
                format!("system health {:.2} collapsed", health)
            };
            state.recovery = None;
            state.concurrency = min;
            state.stability_counter = 0;
            state.consecutive_decrease = 0;
            state.last_change = Some(now);
            state.last_status = "breaker".into();
            actions.apply_width = Some(min);
            actions.trip = Some((
                reason.clone(),
                json!({
                    "avgCpu": avg_cpu,
                    "avgMem": avg_mem,
                    "avgError": avg_error,
                    "avgBacklog": avg_backlog,
                    "avgResponseTime": avg_response,
                    "systemHealth": health,
                }),
            ));
            return (ControlDecision::Tripped { reason }, actions);
        }

        if let Some(recovery) = &mut state.recovery {
            recovery.steps_done += 1;
            state.concurrency = (state.concurrency + recovery.step).min(recovery.target);
            let to = state.concurrency;
            let finished =
                to >= recovery.target || recovery.steps_done >= MAX_RECOVERY_STEPS;
            if finished {
                state.recovery = None;
                state.stability_counter = 0;
                state.last_status = "stable".into();
            } else {
                state.last_status = "recovery".into();
            }
            state.last_change = Some(now);
            actions.apply_width = Some(to);
            return (ControlDecision::RecoveryStep { to, finished }, actions);
        }

        let in_cooldown = state
            .last_change
            .is_some_and(|at| now.duration_since(at) < self.config.cooldown);

        // Flat-and-healthy trends score zero; that still counts as healthy
        // for scaling up as long as nothing trends the wrong way.
        let healthy = health > 0.3
            || (health >= 0.0
                && cpu_trend <= 0.0
                && error_trend <= 0.0
                && response_trend <= 0.0);
        let wants_increase = healthy
            && avg_cpu < 1.5
            && avg_mem > 0.4
            && avg_backlog > 5.0
            && avg_error < 0.07;

        let response_spike =
            previous_avg_response > 0.0 && avg_response > previous_avg_response * 1.5;
        let wants_decrease = health < -0.3
            || avg_cpu > 2.0
            || avg_mem < 0.2
            || avg_error > 0.1
            || response_spike;

        if wants_increase {
            if in_cooldown {
                state.last_status = "cooldown".into();
                return (ControlDecision::Cooldown, actions);
            }
            state.consecutive_decrease = 0;
            let mut delta = 1usize;
            if state.stability_counter > CONCURRENCY_STABILITY_THRESHOLD && avg_backlog > 20.0 {
                delta = CONCURRENCY_INCREASE_RATE
                    .min((avg_backlog / 10.0).floor() as usize)
                    .max(1);
            }
            let predictive = state.pattern.suggest(sample.hour, state.concurrency);
            if predictive > delta as i64 {
                delta = predictive as usize;
            }
            let to = (state.concurrency + delta).min(max);
            let by = to - state.concurrency;
            state.stability_counter += 1;
            if by == 0 {
                state.last_status = "stable".into();
                return (ControlDecision::Stable, actions);
            }
            state.concurrency = to;
            state.last_change = Some(now);
            state.last_status = "increasing".into();
            actions.apply_width = Some(to);
            return (ControlDecision::Increased { to, by }, actions);
        }

        if wants_decrease {
            if in_cooldown {
                state.last_status = "cooldown".into();
                return (ControlDecision::Cooldown, actions);
            }
            state.consecutive_decrease += 1;
            state.stability_counter = 0;
            let severity: usize = if avg_error > 0.2 {
                3
            } else if health < -0.6 {
                2
            } else {
                1
            };
            let step = state.consecutive_decrease.min(MAX_DECREASE_STEP) as usize * severity;
            let to = state.concurrency.saturating_sub(step).max(min);
            let by = state.concurrency - to;
            state.concurrency = to;
            state.last_change = Some(now);
            state.last_status = "decreasing".into();
            if by > 0 {
                actions.apply_width = Some(to);
            }
            return (ControlDecision::Decreased { to, by }, actions);
        }

        state.stability_counter += 1;
        state.consecutive_decrease = 0;
        let predictive = state.pattern.suggest(sample.hour, state.concurrency);
        let long_since_change = state
            .last_change
            .map_or(true, |at| now.duration_since(at) > self.config.cooldown * 2);
        if predictive.abs() >= 2 && long_since_change {
            let to = ((state.concurrency as i64 + predictive)
                .clamp(min as i64, max as i64)) as usize;
            if to != state.concurrency {
                state.concurrency = to;
                state.last_change = Some(now);
                state.last_status = "predictive".into();
                actions.apply_width = Some(to);
                return (
                    ControlDecision::Predictive {
                        to,
                        delta: predictive,
                    },
                    actions,
                );
            }
        }
        state.last_status = "stable".into();
        (ControlDecision::Stable, actions)
    }

    /// Spawns the periodic tick loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.cooldown);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so the
            // windows fill on the configured cadence.
            interval.tick().await;
            loop {
                interval.tick().await;
                let decision = self.tick().await;
                tracing::debug!(?decision, concurrency = self.concurrency(), "controller tick");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use volley_store::MemoryKv;

    struct FakeHost;
    impl HostProbe for FakeHost {
        fn sample(&self) -> crate::signals::HostSample {
            crate::signals::HostSample {
                cpu_load: 0.5,
                mem_free_ratio: 0.6,
            }
        }
    }

    struct FakeBacklog;
    #[async_trait]
    impl BacklogProbe for FakeBacklog {
        async fn waiting_jobs(&self) -> usize {
            0
        }
    }

    #[derive(Default)]
    struct CapturingActuator {
        widths: Mutex<Vec<usize>>,
        autotunes: AtomicUsize,
    }

    #[async_trait]
    impl ConcurrencyActuator for CapturingActuator {
        async fn apply_concurrency(&self, width: usize) {
            self.widths
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(width);
        }

        async fn autotune_limiter(&self, _error_rate: f64, _avg_response_ms: f64) {
            self.autotunes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller(config: DispatchConfig) -> (Arc<AdaptiveController>, Arc<CapturingActuator>) {
        let store = Arc::new(ContextStore::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(3600),
        ));
        let metrics = Arc::new(MetricsAggregator::new(
            store.clone(),
            Duration::from_secs(300),
        ));
        let breaker = Arc::new(CircuitBreaker::new(config.cb_reset_timeout));
        let actuator = Arc::new(CapturingActuator::default());
        let controller = Arc::new(AdaptiveController::new(
            config,
            metrics,
            store,
            breaker,
            Arc::new(FakeHost),
            Arc::new(FakeBacklog),
            actuator.clone(),
        ));
        (controller, actuator)
    }

    fn healthy_sample(backlog: usize) -> ControlSample {
        ControlSample {
            cpu_load: 0.5,
            mem_free_ratio: 0.6,
            error_fraction: 0.02,
            backlog,
            avg_response_ms: 120.0,
            hour: 9,
        }
    }

    fn failing_sample() -> ControlSample {
        ControlSample {
            cpu_load: 0.8,
            mem_free_ratio: 0.5,
            error_fraction: 0.4,
            backlog: 10,
            avg_response_ms: 400.0,
            hour: 9,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn steady_healthy_backlog_increases_each_tick() {
        let (controller, _actuator) = controller(DispatchConfig::default());
        let mut last = controller.concurrency();
        for tick in 0..6 {
            tokio::time::advance(Duration::from_secs(31)).await;
            let decision = controller.tick_with(healthy_sample(50)).await;
            let now = controller.concurrency();
            assert!(now > last, "tick {}: expected increase, got {:?}", tick, decision);
            assert!(now <= 50);
            last = now;
        }
        // After the stability threshold, step size becomes min(2, 50/10) = 2.
        tokio::time::advance(Duration::from_secs(31)).await;
        let decision = controller.tick_with(healthy_sample(50)).await;
        assert_eq!(
            decision,
            ControlDecision::Increased {
                to: last + 2,
                by: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_leaves_the_band() {
        let config = DispatchConfig::default();
        let (controller, _actuator) = controller(config.clone());
        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(31)).await;
            controller.tick_with(healthy_sample(200)).await;
            let c = controller.concurrency();
            assert!(c >= config.min_concurrency && c <= config.max_concurrency);
        }
        assert_eq!(controller.concurrency(), config.max_concurrency);
    }

    #[tokio::test(start_paused = true)]
    async fn high_error_rate_trips_breaker_within_one_tick() {
        let (controller, actuator) = controller(DispatchConfig::default());
        let decision = controller.tick_with(failing_sample()).await;
        assert!(matches!(decision, ControlDecision::Tripped { .. }));
        assert_eq!(controller.concurrency(), 20);
        assert!(controller.status().breaker_active);
        assert_eq!(
            actuator
                .widths
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_slice(),
            [20]
        );

        // While open, every tick holds.
        tokio::time::advance(Duration::from_secs(31)).await;
        let decision = controller.tick_with(healthy_sample(10)).await;
        assert_eq!(decision, ControlDecision::BreakerHeld);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_climbs_to_target_in_five_steps() {
        let config = DispatchConfig::default();
        let (controller, _actuator) = controller(config.clone());
        controller.tick_with(failing_sample()).await;

        // Wait out the reset timeout, then the first tick enters recovery.
        tokio::time::advance(Duration::from_secs(61)).await;
        let decision = controller.tick_with(healthy_sample(10)).await;
        assert_eq!(decision, ControlDecision::RecoveryStarted);
        assert_eq!(controller.concurrency(), config.min_concurrency);
        assert!(controller.status().recovery_active);

        let mut widths = Vec::new();
        loop {
            tokio::time::advance(Duration::from_secs(31)).await;
            match controller.tick_with(healthy_sample(10)).await {
                ControlDecision::RecoveryStep { to, finished } => {
                    widths.push(to);
                    if finished {
                        break;
                    }
                }
                other => panic!("expected recovery step, got {:?}", other),
            }
        }
        assert_eq!(widths, vec![22, 24, 26, 28, 30]);
        assert!(!controller.status().recovery_active);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_pressure_decreases_with_escalating_steps() {
        let config = DispatchConfig::default();
        let (controller, _actuator) = controller(config.clone());
        // Build up some headroom first.
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(31)).await;
            controller.tick_with(healthy_sample(50)).await;
        }
        let start = controller.concurrency();
        assert!(start > config.min_concurrency);

        let pressure = ControlSample {
            cpu_load: 2.5,
            mem_free_ratio: 0.5,
            error_fraction: 0.05,
            backlog: 10,
            avg_response_ms: 150.0,
            hour: 9,
        };
        tokio::time::advance(Duration::from_secs(31)).await;
        let first = controller.tick_with(pressure).await;
        assert!(matches!(first, ControlDecision::Decreased { by: 1, .. }));
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = controller.tick_with(pressure).await;
        assert!(matches!(second, ControlDecision::Decreased { by: 2, .. }));
        assert!(controller.concurrency() >= config.min_concurrency);
    }

    #[tokio::test(start_paused = true)]
    async fn per_decision_cooldown_holds_changes() {
        let (controller, _actuator) = controller(DispatchConfig::default());
        tokio::time::advance(Duration::from_secs(31)).await;
        let first = controller.tick_with(healthy_sample(50)).await;
        assert!(matches!(first, ControlDecision::Increased { .. }));
        // Only five seconds later: inside the cooldown window.
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = controller.tick_with(healthy_sample(50)).await;
        assert_eq!(second, ControlDecision::Cooldown);
    }

    #[tokio::test(start_paused = true)]
    async fn autotune_fires_every_other_tick() {
        let (controller, actuator) = controller(DispatchConfig::default());
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(31)).await;
            controller.tick_with(healthy_sample(2)).await;
        }
        assert_eq!(actuator.autotunes.load(Ordering::SeqCst), 2);
    }
}
