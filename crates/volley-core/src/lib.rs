//! Core domain model for the volley dispatch engine: identities, process
//! configuration, the failure taxonomy, and every persisted artifact shape.
//!
//! This crate is transport- and storage-agnostic; the store, control, and
//! dispatch crates build on it.

pub mod classify;
pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod record;
pub mod session;
pub mod trace;

pub use classify::{
    classify_response, classify_transport, parse_retry_after, ApiError, ErrorCategory,
    TransportCondition,
};
pub use config::DispatchConfig;
pub use error::{DispatchError, Result};
pub use identity::{trace_id, user_action_error_id, JobId, RequestId, SessionId, WorkerId};
pub use job::{JobProgress, JobReport, JobSpec, JobState};
pub use record::{validate_batch, Record, RecordValidationError};
pub use session::{Session, SessionAuth};
pub use trace::{
    CircuitBreakerRecord, ProgressSample, RequestTrace, SessionStats, SuccessResponse,
    UserActionError, WorkerMetrics,
};
