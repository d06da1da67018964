use crate::config::ConfigDefaults;
use crate::error_handling::ErrorLog;
use crate::exception::{WardenError, WardenResult};
use crate::kv::KvStore;
use crate::metrics::LockMetrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_util::TimeUtils;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    pub max_concurrent: u64,
    /// Permits older than this are treated as abandoned
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub key_prefix: String,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_ms: 30_000,
            poll_interval_ms: 100,
            key_prefix: "semaphore:".to_string(),
        }
    }
}

impl ConfigDefaults for SemaphoreConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("Semaphore needs at least one permit".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("Poll interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// A granted permit: member of the sorted set, scored by `acquired_at` (epoch ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permit {
    pub identifier: String,
    pub acquired_at: i64,
}

/// Bounded-concurrency permit pool shared through a sorted set in the key-value store
pub struct DistributedSemaphore {
    store: Arc<dyn KvStore>,
    key: String,
    config: SemaphoreConfig,
    metrics: LockMetrics,
}

impl std::fmt::Debug for DistributedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSemaphore")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributedSemaphore {
    pub fn new(store: Arc<dyn KvStore>, name: &str, config: SemaphoreConfig) -> Self {
        Self {
            store,
            key: format!("{}{}", config.key_prefix, name),
            config,
            metrics: LockMetrics::new("semaphore"),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Drop permits held longer than the timeout
    async fn trim_expired(&self) -> WardenResult<u64> {
        let cutoff = TimeUtils::timestamp_millis().saturating_sub_unsigned(self.config.timeout_ms);
        let removed = self
            .store
            .zremrangebyscore(&self.key, f64::NEG_INFINITY, cutoff as f64)
            .await?;
        if removed > 0 {
            warn!("Reclaimed {} abandoned permits on {}", removed, self.key);
        }
        Ok(removed)
    }

    /// One non-blocking attempt; `Ok(None)` when all permits are taken
    pub async fn acquire_permit(&self) -> WardenResult<Option<Permit>> {
        self.trim_expired().await?;
        let permit = Permit {
            identifier: Uuid::new_v4().to_string(),
            acquired_at: TimeUtils::timestamp_millis(),
        };
        let added = self
            .store
            .zadd_bounded(
                &self.key,
                &permit.identifier,
                permit.acquired_at as f64,
                self.config.max_concurrent,
            )
            .await?;
        if added {
            debug!("Permit {} granted on {}", permit.identifier, self.key);
            Ok(Some(permit))
        } else {
            self.metrics.record_contention();
            Ok(None)
        }
    }

    pub async fn acquire(&self) -> WardenResult<Option<String>> {
        Ok(self.acquire_permit().await?.map(|permit| permit.identifier))
    }

    pub async fn release(&self, identifier: &str) -> WardenResult<bool> {
        let removed = self.store.zrem(&self.key, identifier).await?;
        if removed {
            self.metrics.record_released();
        }
        Ok(removed)
    }

    /// Live permit count
    pub async fn get_count(&self) -> WardenResult<u64> {
        self.trim_expired().await?;
        self.store.zcard(&self.key).await
    }

    /// Poll for a permit until `wait_timeout`, run `f`, then release the permit.
    /// No timeout means wait indefinitely.
    pub async fn with_permit<T, F, Fut>(&self, f: F, wait_timeout: Option<Duration>) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let started = Instant::now();
        let deadline = wait_timeout.map(|timeout| started + timeout);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        let identifier = loop {
            if let Some(identifier) = self.acquire().await? {
                break identifier;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.metrics.record_failed();
                        return Err(WardenError::SemaphoreTimeout {
                            key: self.key.clone(),
                        });
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            tokio::time::sleep(pause).await;
        };
        self.metrics.record_acquired(started.elapsed());

        let guard = PermitGuard {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            identifier: Some(identifier.clone()),
        };
        let result = f().await;
        guard.disarm();

        if let Ok(false) = self
            .release(&identifier)
            .await
            .log_error("Failed to release semaphore permit")
        {
            debug!("Permit {} on {} was trimmed before release", identifier, self.key);
        }
        result
    }
}

/// Returns the permit from `Drop` when `with_permit` is cancelled
struct PermitGuard {
    store: Arc<dyn KvStore>,
    key: String,
    identifier: Option<String>,
}

impl PermitGuard {
    fn disarm(mut self) {
        self.identifier = None;
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let Some(identifier) = self.identifier.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(e) = store.zrem(&key, &identifier).await {
                warn!("Returning permit {} on {} failed: {}", identifier, key, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn semaphore(max_concurrent: u64) -> (InMemoryKvStore, DistributedSemaphore) {
        let store = InMemoryKvStore::new("kv-0");
        let config = SemaphoreConfig {
            max_concurrent,
            ..Default::default()
        };
        let semaphore = DistributedSemaphore::new(Arc::new(store.clone()), "exports", config);
        (store, semaphore)
    }

    #[tokio::test]
    async fn test_fourth_acquire_refused_until_release() {
        let (_, semaphore) = semaphore(3);
        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(semaphore.acquire().await.unwrap().expect("permit"));
        }
        assert!(semaphore.acquire().await.unwrap().is_none());
        assert_eq!(semaphore.get_count().await.unwrap(), 3);

        assert!(semaphore.release(&permits[0]).await.unwrap());
        assert!(!semaphore.release(&permits[0]).await.unwrap());
        assert!(semaphore.acquire().await.unwrap().is_some());
        assert_eq!(semaphore.get_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_abandoned_permits_are_trimmed() {
        let (store, semaphore) = semaphore(1);
        let stale = (TimeUtils::timestamp_millis() - 60_000) as f64;
        assert!(store
            .zadd_bounded("semaphore:exports", "crashed-holder", stale, 1)
            .await
            .unwrap());

        assert!(semaphore.acquire().await.unwrap().is_some());
        assert_eq!(semaphore.get_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_permit_times_out() {
        let (_, semaphore) = semaphore(1);
        let _held = semaphore.acquire().await.unwrap().unwrap();

        let start = Instant::now();
        let result = semaphore
            .with_permit(|| async { Ok(()) }, Some(Duration::from_millis(350)))
            .await;
        assert!(matches!(result, Err(WardenError::SemaphoreTimeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_permit_releases_after_error() {
        let (_, semaphore) = semaphore(1);
        let result: WardenResult<()> = semaphore
            .with_permit(|| async { Err(WardenError::internal("boom")) }, None)
            .await;
        assert!(result.is_err());
        assert_eq!(semaphore.get_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_permit_waits_for_release() {
        let (_, semaphore) = semaphore(1);
        let semaphore = Arc::new(semaphore);
        let held = semaphore.acquire().await.unwrap().unwrap();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                semaphore
                    .with_permit(|| async { Ok("ran") }, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!waiter.is_finished());

        semaphore.release(&held).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "ran");
        assert_eq!(semaphore.get_count().await.unwrap(), 0);
    }
}
