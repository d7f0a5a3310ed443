//! In-process store backend
//!
//! Implements the same conditional semantics as the Redis backend inside one
//! process. TTLs are measured on the tokio clock so paused-time tests can
//! drive expiry deterministically.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{SharedStore, StoreResult};
use crate::utils::error::StoreError;

/// Pub/sub messages retained for inspection; older ones are dropped
pub const PUBLISHED_CAPACITY: usize = 1024;

/// Sorted-set score with a total order
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    ordered: BTreeSet<(Score, String)>,
    scores: HashMap<String, Score>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), Score(score)) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn pop_first(&mut self) -> Option<(String, f64)> {
        let (score, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some((member, score.0))
    }
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, SortedSet>,
    published: VecDeque<(String, String)>,
}

impl State {
    /// Live string entry, dropping it first if expired
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}

/// Shared store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    changed: Notify,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent published messages, oldest first
    ///
    /// At most [`PUBLISHED_CAPACITY`] are kept.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.state.lock().await.published.iter().cloned().collect()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.live(key).map(|e| e.value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let matches = state.live(key).is_some_and(|e| e.value == expected);
        if matches {
            state.strings.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.live(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut state = self.state.lock().await;
        Ok(state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|e| StoreError::corrupt(format!("{key}.{field}"), e))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let current = match state.live(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|e| StoreError::corrupt(key, e))?,
            None => 0,
        };
        let next = current + 1;
        state.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state
                .zsets
                .entry(key.to_string())
                .or_default()
                .insert(member, score);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.zsets.get_mut(key).is_some_and(|z| z.remove(member)))
    }

    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut state = self.state.lock().await;
        Ok(state.zsets.get_mut(key).and_then(SortedSet::pop_first))
    }

    async fn bzpopmin(
        &self,
        key: &str,
        timeout: Duration,
    ) -> StoreResult<Option<(String, f64)>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a concurrent zadd is not missed
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.zpopmin(key).await? {
                return Ok(Some(popped));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let state = self.state.lock().await;
        Ok(state
            .zsets
            .get(key)
            .map(|z| {
                z.ordered
                    .iter()
                    .take_while(|(score, _)| score.0 <= max)
                    .take(limit)
                    .map(|(score, member)| (member.clone(), score.0))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).map_or(0, |z| z.scores.len() as u64))
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.published.len() == PUBLISHED_CAPACITY {
            state.published.pop_front();
        }
        state
            .published
            .push_back((channel.to_string(), message.to_string()));
        Ok(())
    }
}
