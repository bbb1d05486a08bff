//! Batch worker plane: the job-queue contract, the batch worker that fans
//! records out through the pool, and the runtime assembly that wires the
//! whole dispatcher together.

pub mod queue;
pub mod runtime;
pub mod worker;

pub use queue::{JobOptions, JobQueue, MemoryQueue, QueuedJob};
pub use runtime::{init_tracing, DispatcherRuntime, RuntimeOptions};
pub use worker::{auth_headers, BatchWorker, JobVerdict, StatusProbe, SUB_BATCH_SIZE};
