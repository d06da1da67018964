use super::KvStore;
use crate::exception::{WardenError, WardenResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct KvState {
    strings: HashMap<String, StringEntry>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
}

impl KvState {
    /// Live entry for `key`, evicting it first if it has expired
    fn live_entry(&mut self, key: &str, now: Instant) -> Option<&mut StringEntry> {
        if self.strings.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}

/// In-process key-value store with the same atomicity guarantees as the Redis scripts.
///
/// Clones share state. Supports fault injection (`set_available`) and artificial
/// latency so quorum and validity-window behaviour can be tested.
#[derive(Debug, Clone)]
pub struct InMemoryKvStore {
    name: String,
    state: Arc<Mutex<KvState>>,
    available: Arc<AtomicBool>,
    latency_micros: Arc<AtomicU64>,
}

impl InMemoryKvStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(KvState::default())),
            available: Arc::new(AtomicBool::new(true)),
            latency_micros: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate the instance going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.store(micros, Ordering::SeqCst);
    }

    /// Overwrite a key without any ownership check, as a competing process would after expiry
    pub async fn force_set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut state = self.state.lock().await;
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    async fn enter(&self, op: &str, key: &str) -> WardenResult<()> {
        let latency = self.latency_micros.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if !self.is_available() {
            return Err(WardenError::store(format!(
                "{op} {key}: instance {} unavailable",
                self.name
            )));
        }
        trace!(instance = %self.name, "{} {}", op, key);
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> WardenResult<bool> {
        self.enter("SET NX PX", key).await?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.live_entry(key, now).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> WardenResult<Option<String>> {
        self.enter("GET", key).await?;
        let mut state = self.state.lock().await;
        Ok(state
            .live_entry(key, Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> WardenResult<bool> {
        self.enter("CAD", key).await?;
        let mut state = self.state.lock().await;
        let matches = state
            .live_entry(key, Instant::now())
            .is_some_and(|entry| entry.value == expected);
        if matches {
            state.strings.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> WardenResult<bool> {
        self.enter("CAPEXPIRE", key).await?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.live_entry(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> WardenResult<Option<Duration>> {
        self.enter("PTTL", key).await?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state
            .live_entry(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> WardenResult<u64> {
        self.enter("ZREMRANGEBYSCORE", key).await?;
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score < min || *score > max);
        let removed = before - set.len();
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(removed as u64)
    }

    async fn zadd_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max_cardinality: u64,
    ) -> WardenResult<bool> {
        self.enter("ZADD BOUNDED", key).await?;
        let mut state = self.state.lock().await;
        let set = state.sorted_sets.entry(key.to_string()).or_default();
        if set.len() as u64 >= max_cardinality {
            return Ok(false);
        }
        set.insert(member.to_string(), score);
        Ok(true)
    }

    async fn zrem(&self, key: &str, member: &str) -> WardenResult<bool> {
        self.enter("ZREM", key).await?;
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> WardenResult<u64> {
        self.enter("ZCARD", key).await?;
        let state = self.state.lock().await;
        Ok(state.sorted_sets.get(key).map_or(0, |set| set.len() as u64))
    }
}
