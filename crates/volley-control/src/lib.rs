//! Control plane of the dispatch engine: rolling API metrics, host signal
//! sampling, the process-wide circuit breaker, hour-of-day prediction, and
//! the adaptive concurrency controller that ties them together.

pub mod breaker;
pub mod controller;
pub mod metrics;
pub mod prediction;
pub mod signals;

pub use breaker::CircuitBreaker;
pub use controller::{
    AdaptiveController, BacklogProbe, ConcurrencyActuator, ControlDecision, ControlSample,
    ControllerStatus,
};
pub use metrics::{normalize_url_pattern, CallSample, MetricsAggregator};
pub use prediction::HourlyPattern;
pub use signals::{trend, HostProbe, HostSample, MovingWindow, SysinfoProbe, TrendWindow};
