//! Durable store layer: the KV contract the engine assumes
//! (hash/list/sorted-set/TTL primitives), an in-memory reference
//! implementation, an optional Redis backend, and the context-store policy
//! layer that owns the key namespace and TTL rules.

pub mod context;
pub mod keys;
pub mod kv;
pub mod log_sink;
pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use context::{ContextStore, TerminalOutcome};
pub use kv::{KvOp, KvStore};
pub use log_sink::{LogSink, StderrLogSink, StoreLogSink};
pub use memory::MemoryKv;
#[cfg(feature = "redis-store")]
pub use redis::RedisKv;
