//! Engine-level error type.
//!
//! Classified API failures travel as structured [`ApiError`](crate::classify::ApiError)
//! values through the pool and pipeline; they are never raised as opaque errors
//! across component boundaries. `DispatchError` covers everything else: the
//! durable store, the queue, HTTP transport setup, pool plumbing, and
//! configuration.

use crate::classify::ApiError;

/// Engine-level error type.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(String),
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Http error: {0}")]
    Http(String),
    #[error("Pool error: {0}")]
    Pool(String),
    #[error("Config error: {0}")]
    Config(String),
    /// A classified API failure (for retry and bookkeeping decisions).
    #[error("Api: {0}")]
    Api(ApiError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
