//! Redis implementation of the KV contract.
//!
//! Batches map directly onto a Redis pipeline, which is what the contract's
//! one-round-trip guarantee means here. Connections go through a
//! multiplexed connection manager so the store handle is cheap to clone
//! across tasks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use volley_core::{DispatchError, Result};

use crate::kv::{KvOp, KvStore};

/// Redis-backed KV store.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connects to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| DispatchError::Store(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| DispatchError::Store(format!("redis connect failed: {}", e)))?;
        Ok(Self { manager })
    }

    fn store_err(e: redis::RedisError) -> DispatchError {
        DispatchError::Store(e.to_string())
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    // Redis EXPIRE of 0 deletes the key; keep at least one second.
    (ttl.as_secs() as i64).max(1)
}

#[async_trait]
impl KvStore for RedisKv {
    async fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                KvOp::SetJson { key, value, ttl } => {
                    pipe.set(key, value.to_string()).ignore();
                    if let Some(ttl) = ttl {
                        pipe.expire(key, ttl_seconds(*ttl)).ignore();
                    }
                }
                KvOp::HashSet { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                KvOp::HashIncr { key, field, by } => {
                    pipe.hincr(key, field, *by).ignore();
                }
                KvOp::ListPush { key, value } => {
                    pipe.rpush(key, value).ignore();
                }
                KvOp::ListTrimLast { key, keep } => {
                    pipe.ltrim(key, -(*keep as isize), -1).ignore();
                }
                KvOp::ZsetAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                KvOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl_seconds(*ttl)).ignore();
                }
            }
        }
        let mut conn = self.manager.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(Self::store_err)?;
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await.map_err(Self::store_err)?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| DispatchError::Store(format!("corrupt json at {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await.map_err(Self::store_err)?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(Self::store_err)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(Self::store_err)
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        conn.zrangebyscore_limit_withscores(key, min, max, 0, limit as isize)
            .await
            .map_err(Self::store_err)
    }
}
