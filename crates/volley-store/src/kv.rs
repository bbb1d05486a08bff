//! Durable KV contract.
//!
//! The engine assumes a store with hash, list, sorted-set, and TTL
//! primitives. Implementations must make two guarantees:
//! - [`KvStore::apply`] executes its batch in one round-trip where the
//!   backend allows it (a pipeline); callers use it for multi-key updates
//!   that must not interleave with other writers' round-trips.
//! - TTLs set via [`KvOp::Expire`] refresh the full lifetime (last write
//!   wins).
//!
//! Individual reads are plain point operations; readers must tolerate a
//! brief window where an index references a not-yet-populated value.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use volley_core::Result;

/// One write in a pipelined batch.
#[derive(Clone, Debug)]
pub enum KvOp {
    /// Set a JSON value, optionally with a TTL.
    SetJson {
        key: String,
        value: Value,
        ttl: Option<Duration>,
    },
    /// Set hash fields (creating the hash when absent).
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Increment an integer hash field.
    HashIncr { key: String, field: String, by: i64 },
    /// Append to a list.
    ListPush { key: String, value: String },
    /// Trim a list to its last `keep` entries.
    ListTrimLast { key: String, keep: usize },
    /// Add (or re-score) a sorted-set member.
    ZsetAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Set or refresh a key's TTL.
    Expire { key: String, ttl: Duration },
}

/// Storage façade over the durable KV.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Applies a batch of writes in one round-trip where possible.
    async fn apply(&self, ops: Vec<KvOp>) -> Result<()>;

    async fn get_json(&self, key: &str) -> Result<Option<Value>>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// List entries from `start` to `stop` inclusive (negative indices count
    /// from the tail, as in the backend's native range semantics).
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Sorted-set members with `min <= score <= max`, ascending by score.
    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;
}
