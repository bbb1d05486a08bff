//! In-memory implementation of the KV contract.
//!
//! Reference implementation for tests and single-process deployments.
//! A batch is applied under one lock, which gives it the same
//! no-interleaving guarantee a backend pipeline provides. TTLs are enforced
//! lazily on access.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use volley_core::Result;

use crate::kv::{KvOp, KvStore};

#[derive(Default)]
struct MemoryInner {
    json: HashMap<String, Value>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    expiries: HashMap<String, Instant>,
}

impl MemoryInner {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        let mut removed = false;
        removed |= self.json.remove(key).is_some();
        removed |= self.hashes.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.zsets.remove(key).is_some();
        self.expiries.remove(key);
        removed
    }

    fn apply(&mut self, op: KvOp, now: Instant) {
        match op {
            KvOp::SetJson { key, value, ttl } => {
                self.json.insert(key.clone(), value);
                match ttl {
                    Some(ttl) => {
                        self.expiries.insert(key, now + ttl);
                    }
                    None => {
                        self.expiries.remove(&key);
                    }
                }
            }
            KvOp::HashSet { key, fields } => {
                let hash = self.hashes.entry(key).or_default();
                for (field, value) in fields {
                    hash.insert(field, value);
                }
            }
            KvOp::HashIncr { key, field, by } => {
                let hash = self.hashes.entry(key).or_default();
                let slot = hash.entry(field).or_insert_with(|| "0".to_string());
                let current: i64 = slot.parse().unwrap_or(0);
                *slot = (current + by).to_string();
            }
            KvOp::ListPush { key, value } => {
                self.lists.entry(key).or_default().push(value);
            }
            KvOp::ListTrimLast { key, keep } => {
                if let Some(list) = self.lists.get_mut(&key) {
                    if list.len() > keep {
                        let drop = list.len() - keep;
                        list.drain(..drop);
                    }
                }
            }
            KvOp::ZsetAdd { key, member, score } => {
                let zset = self.zsets.entry(key).or_default();
                match zset.iter_mut().find(|(m, _)| *m == member) {
                    Some(slot) => slot.1 = score,
                    None => zset.push((member, score)),
                }
                zset.sort_by(|a, b| a.1.total_cmp(&b.1));
            }
            KvOp::Expire { key, ttl } => {
                self.expiries.insert(key, now + ttl);
            }
        }
    }
}

/// In-memory KV store.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remaining TTL for a key, if one is set. Test hook.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.lock();
        inner
            .expiries
            .get(key)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.purge_expired(now);
        for op in ops {
            inner.apply(op, now);
        }
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        Ok(inner.json.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        Ok(inner.remove(key))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let resolve = |index: i64| -> i64 {
            if index < 0 {
                (len + index).max(0)
            } else {
                index
            }
        };
        let from = resolve(start).min(len) as usize;
        let to = resolve(stop).min(len - 1);
        if to < from as i64 {
            return Ok(Vec::new());
        }
        Ok(list[from..=(to as usize)].to_vec())
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn batch_applies_hash_list_and_zset_ops() {
        let kv = MemoryKv::new();
        kv.apply(vec![
            KvOp::HashSet {
                key: "h".into(),
                fields: vec![("a".into(), "1".into())],
            },
            KvOp::HashIncr {
                key: "h".into(),
                field: "count".into(),
                by: 2,
            },
            KvOp::ListPush {
                key: "l".into(),
                value: "x".into(),
            },
            KvOp::ZsetAdd {
                key: "z".into(),
                member: "m1".into(),
                score: 5.0,
            },
        ])
        .await
        .expect("apply");

        let hash = kv.hash_get_all("h").await.expect("hash");
        assert_eq!(hash["a"], "1");
        assert_eq!(hash["count"], "2");
        assert_eq!(kv.list_range("l", 0, -1).await.expect("list"), vec!["x"]);
        assert_eq!(
            kv.zset_range_by_score("z", 0.0, 10.0, 10).await.expect("zset"),
            vec![("m1".to_string(), 5.0)]
        );
    }

    #[tokio::test]
    async fn zset_rescore_does_not_duplicate_member() {
        let kv = MemoryKv::new();
        for score in [1.0, 2.0] {
            kv.apply(vec![KvOp::ZsetAdd {
                key: "z".into(),
                member: "m1".into(),
                score,
            }])
            .await
            .expect("apply");
        }
        let members = kv.zset_range_by_score("z", 0.0, 10.0, 10).await.expect("zset");
        assert_eq!(members, vec![("m1".to_string(), 2.0)]);
    }

    #[tokio::test]
    async fn list_trim_keeps_last_entries() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.apply(vec![KvOp::ListPush {
                key: "l".into(),
                value: i.to_string(),
            }])
            .await
            .expect("push");
        }
        kv.apply(vec![KvOp::ListTrimLast {
            key: "l".into(),
            keep: 2,
        }])
        .await
        .expect("trim");
        assert_eq!(kv.list_range("l", 0, -1).await.expect("list"), vec!["3", "4"]);
    }

    #[tokio::test]
    async fn expired_keys_vanish_on_access() {
        let kv = MemoryKv::new();
        kv.apply(vec![KvOp::SetJson {
            key: "k".into(),
            value: json!({"a": 1}),
            ttl: Some(Duration::from_millis(0)),
        }])
        .await
        .expect("set");
        assert_eq!(kv.get_json("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn negative_list_range_reads_tail() {
        let kv = MemoryKv::new();
        for value in ["a", "b", "c"] {
            kv.apply(vec![KvOp::ListPush {
                key: "l".into(),
                value: value.into(),
            }])
            .await
            .expect("push");
        }
        assert_eq!(
            kv.list_range("l", -2, -1).await.expect("range"),
            vec!["b", "c"]
        );
    }
}
