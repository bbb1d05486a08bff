//! Process configuration for the dispatch engine.
//!
//! All knobs come from the environment with fixed defaults; the resulting
//! value is passed to constructors. There is no global configuration state.

use std::time::Duration;

use crate::error::DispatchError;

/// Tuning knobs for the adaptive controller, circuit breaker, and pipeline.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Lower bound on job-handler concurrency.
    pub min_concurrency: usize,
    /// Upper bound on job-handler concurrency.
    pub max_concurrency: usize,
    /// Controller tick interval; also the per-change cooldown.
    pub cooldown: Duration,
    /// Error fraction above which the circuit breaker trips.
    pub cb_error_threshold: f64,
    /// How long the breaker rejects traffic after a trip.
    pub cb_reset_timeout: Duration,
    /// Moving-average window for controller signals.
    pub history_length: usize,
    /// Window for per-signal trend scoring.
    pub trend_history_length: usize,
    /// Retained system-health samples.
    pub system_health_history: usize,
    /// How often hour-of-day prediction is refreshed.
    pub prediction_update_interval: Duration,
    /// Window for the rolling API error rate.
    pub error_window: Duration,
    /// Hard timeout for a single pool task.
    pub pool_task_timeout: Duration,
    /// Session lifetime in the durable store.
    pub session_ttl: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 20,
            max_concurrency: 50,
            cooldown: Duration::from_millis(30_000),
            cb_error_threshold: 0.30,
            cb_reset_timeout: Duration::from_millis(60_000),
            history_length: 5,
            trend_history_length: 3,
            system_health_history: 10,
            prediction_update_interval: Duration::from_millis(900_000),
            error_window: Duration::from_millis(300_000),
            pool_task_timeout: Duration::from_millis(30_000),
            session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl DispatchConfig {
    /// Reads configuration from the environment, falling back to defaults.
    ///
    /// Millisecond-valued variables (`*_MS`, `*_TIMEOUT`, `*_INTERVAL`) are
    /// integers; malformed values are a hard configuration error rather than
    /// a silent fallback.
    pub fn from_env() -> Result<Self, DispatchError> {
        let defaults = Self::default();
        let cfg = Self {
            min_concurrency: read_usize("MIN_CONCURRENCY", defaults.min_concurrency)?,
            max_concurrency: read_usize("MAX_CONCURRENCY", defaults.max_concurrency)?,
            cooldown: read_millis("COOLDOWN_MS", defaults.cooldown)?,
            cb_error_threshold: read_f64("CB_ERROR_THRESHOLD", defaults.cb_error_threshold)?,
            cb_reset_timeout: read_millis("CB_RESET_TIMEOUT", defaults.cb_reset_timeout)?,
            history_length: read_usize("HISTORY_LENGTH", defaults.history_length)?,
            trend_history_length: read_usize(
                "TREND_HISTORY_LENGTH",
                defaults.trend_history_length,
            )?,
            system_health_history: read_usize(
                "SYSTEM_HEALTH_HISTORY",
                defaults.system_health_history,
            )?,
            prediction_update_interval: read_millis(
                "PREDICTION_UPDATE_INTERVAL",
                defaults.prediction_update_interval,
            )?,
            error_window: read_millis("ERROR_WINDOW_MS", defaults.error_window)?,
            pool_task_timeout: read_millis("POOL_TASK_TIMEOUT", defaults.pool_task_timeout)?,
            session_ttl: read_millis("SESSION_TTL_MS", defaults.session_ttl)?,
        };
        cfg.validate()
    }

    /// Checks cross-field invariants. The controller relies on
    /// `min_concurrency <= max_concurrency` holding for its clamp.
    pub fn validate(self) -> Result<Self, DispatchError> {
        if self.min_concurrency == 0 {
            return Err(DispatchError::Config(
                "MIN_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(DispatchError::Config(format!(
                "MIN_CONCURRENCY ({}) must not exceed MAX_CONCURRENCY ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        if !(0.0..=1.0).contains(&self.cb_error_threshold) {
            return Err(DispatchError::Config(format!(
                "CB_ERROR_THRESHOLD must be within [0, 1], got {}",
                self.cb_error_threshold
            )));
        }
        if self.history_length < 2 || self.trend_history_length < 1 {
            return Err(DispatchError::Config(
                "signal history windows must hold at least two samples".into(),
            ));
        }
        Ok(self)
    }

    /// Midpoint of the concurrency band (prediction samples only above it).
    pub fn concurrency_midpoint(&self) -> usize {
        (self.min_concurrency + self.max_concurrency) / 2
    }

    /// Recovery target after a breaker reset: floor(1.5 * min), clamped to max.
    pub fn recovery_target(&self) -> usize {
        ((self.min_concurrency * 3) / 2).min(self.max_concurrency)
    }
}

fn read_usize(name: &str, default: usize) -> Result<usize, DispatchError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DispatchError::Config(format!("{} must be an integer: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn read_f64(name: &str, default: f64) -> Result<f64, DispatchError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DispatchError::Config(format!("{} must be a number: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn read_millis(name: &str, default: Duration) -> Result<Duration, DispatchError> {
    Ok(Duration::from_millis(read_u64(
        name,
        default.as_millis() as u64,
    )?))
}

fn read_u64(name: &str, default: u64) -> Result<u64, DispatchError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            DispatchError::Config(format!("{} must be integer milliseconds: {:?}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
