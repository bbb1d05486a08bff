//! Dispatch plane of the engine: the global rate limiter, the HTTP
//! executor seam, the bounded worker pool, and the per-record pipeline
//! with typed retry and durable tracing.

pub mod http;
pub mod limiter;
pub mod pipeline;
pub mod pool;
pub mod retry;

pub use http::{attempt_timeout, ApiResponse, HttpExecute, HttpFailure, OutboundRequest, ReqwestExecutor};
pub use limiter::{LimiterSnapshot, RateLimitPermit, RateLimiter, RateLimiterConfig};
pub use pipeline::RecordPipeline;
pub use pool::{
    pool_size_for_host, PoolTask, RecordProcessor, TaskContext, TaskKind, TaskOutcome, WorkerPool,
};
pub use retry::{RetryConfig, RetryDecision};
