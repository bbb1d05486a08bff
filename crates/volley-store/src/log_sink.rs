//! Structured per-session log sink.
//!
//! The store persists logs and the logger writes through the store, so the
//! dependency is inverted: the context store receives a `LogSink` lazily and
//! falls back to standard error until the real sink is wired. Sink failures
//! are never fatal to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::keys;
use crate::kv::{KvOp, KvStore};

const LOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Destination for structured per-session log entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Best effort: implementations swallow their own failures.
    async fn log(&self, session_id: &str, entry: Value);
}

/// Fallback sink writing JSON lines to standard error.
#[derive(Default)]
pub struct StderrLogSink;

#[async_trait]
impl LogSink for StderrLogSink {
    async fn log(&self, session_id: &str, entry: Value) {
        eprintln!("[{}] {}", session_id, entry);
    }
}

/// Durable sink appending to `logs:<sessionId>` with a 24h TTL.
pub struct StoreLogSink {
    kv: Arc<dyn KvStore>,
}

impl StoreLogSink {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl LogSink for StoreLogSink {
    async fn log(&self, session_id: &str, entry: Value) {
        let key = keys::session_logs(&session_id.to_string());
        let result = self
            .kv
            .apply(vec![
                KvOp::ListPush {
                    key: key.clone(),
                    value: entry.to_string(),
                },
                KvOp::Expire { key, ttl: LOG_TTL },
            ])
            .await;
        if let Err(e) = result {
            tracing::warn!(session_id, error = %e, "dropping session log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use serde_json::json;

    #[tokio::test]
    async fn store_sink_appends_with_ttl() {
        let kv = Arc::new(MemoryKv::new());
        let sink = StoreLogSink::new(kv.clone());
        sink.log("S1", json!({"event": "START", "jobId": "J1"})).await;

        let entries = kv.list_range("logs:S1", 0, -1).await.expect("range");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("START"));
        assert!(kv.ttl("logs:S1").expect("ttl set") <= LOG_TTL);
    }
}
