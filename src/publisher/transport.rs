//! Outbound transports
//!
//! A transport confirms each message with an identifier once it is durably
//! accepted. Anything short of that confirmation is a failure.

use async_trait::async_trait;
use deadpool_redis::Pool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::utils::error::PublishError;

/// Delivery capability for serialized messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `topic`, returning the transport's confirmation id
    async fn send(&self, topic: &str, payload: &str) -> Result<String, PublishError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Redis Streams transport (`XADD` with approximate `MAXLEN`)
pub struct RedisStreamTransport {
    pool: Pool,
    max_len: usize,
}

impl RedisStreamTransport {
    /// Create a transport on an existing Redis pool
    pub fn new(pool: Pool, max_len: usize) -> Self {
        Self { pool, max_len }
    }
}

#[async_trait]
impl Transport for RedisStreamTransport {
    async fn send(&self, topic: &str, payload: &str) -> Result<String, PublishError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| PublishError::Transport(format!("no connection: {e}")))?;

        let entry_id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async(&mut *conn)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        Ok(entry_id)
    }

    fn name(&self) -> &'static str {
        "redis-stream"
    }
}

/// In-process transport for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryTransport {
    messages: Mutex<VecDeque<(String, String)>>,
    max_len: Option<usize>,
    sequence: AtomicU64,
    fail_next: AtomicU32,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that keeps only the newest `max_len` messages
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len.max(1)),
            ..Self::default()
        }
    }

    /// Make the next `n` sends fail
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Accepted messages as (topic, payload), oldest first
    pub async fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().await.iter().cloned().collect()
    }

    /// Number of accepted messages
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    /// Whether nothing was accepted yet
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, topic: &str, payload: &str) -> Result<String, PublishError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PublishError::Transport("injected failure".to_string()));
        }

        let mut messages = self.messages.lock().await;
        if self.max_len.is_some_and(|max| messages.len() >= max) {
            messages.pop_front();
        }
        messages.push_back((topic.to_string(), payload.to_string()));
        drop(messages);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mem-{seq}"))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
