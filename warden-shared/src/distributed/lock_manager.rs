use crate::config::ConfigDefaults;
use crate::error_handling::ErrorLog;
use crate::exception::{WardenError, WardenResult};
use crate::kv::KvStore;
use crate::metrics::LockMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use warden_util::{Backoff, RngUtils, TimeUtils};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    pub default_ttl_ms: u64,
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Base delay, doubled after every failed attempt
    pub retry_delay_ms: u64,
    pub key_prefix: String,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            retry_count: 3,
            retry_delay_ms: 100,
            key_prefix: "lock:".to_string(),
        }
    }
}

impl ConfigDefaults for LockManagerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.default_ttl_ms == 0 {
            return Err("Default lock TTL must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Per-call overrides for [`DistributedLockManager::acquire_lock`]
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireOptions {
    pub key: String,
    pub ttl: Option<Duration>,
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl AcquireOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
            retry_count: None,
            retry_delay: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = Some(retry_count);
        self.retry_delay = Some(retry_delay);
        self
    }
}

/// A held lock: the key as the caller named it and the token that owns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
    pub created_at: DateTime<Utc>,
}

/// Single-store distributed mutex. Each key is either free or held by exactly
/// one random token; only that token can release or extend it.
#[derive(Clone)]
pub struct DistributedLockManager {
    store: Arc<dyn KvStore>,
    config: LockManagerConfig,
    metrics: LockMetrics,
}

impl std::fmt::Debug for DistributedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockManager")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

impl DistributedLockManager {
    pub fn new(store: Arc<dyn KvStore>, config: LockManagerConfig) -> Self {
        Self {
            store,
            config,
            metrics: LockMetrics::new("distributed"),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Acquire with retries; `Ok(None)` when every attempt found the key held
    pub async fn acquire_lock(&self, options: AcquireOptions) -> WardenResult<Option<String>> {
        Ok(self.acquire(options).await?.map(|record| record.token))
    }

    /// Same as [`acquire_lock`](Self::acquire_lock), returning the full record
    pub async fn acquire(&self, options: AcquireOptions) -> WardenResult<Option<LockRecord>> {
        let ttl = options
            .ttl
            .unwrap_or(Duration::from_millis(self.config.default_ttl_ms));
        let retry_count = options.retry_count.unwrap_or(self.config.retry_count);
        let backoff = Backoff::doubling(
            options
                .retry_delay
                .unwrap_or(Duration::from_millis(self.config.retry_delay_ms)),
        );
        let lock_key = self.lock_key(&options.key);
        let token = RngUtils::random_token();
        let started = Instant::now();

        for attempt in 0..=retry_count {
            if self.store.set_nx_px(&lock_key, &token, ttl).await? {
                self.metrics.record_acquired(started.elapsed());
                debug!("Acquired lock {} on attempt {}", lock_key, attempt + 1);
                return Ok(Some(LockRecord {
                    key: options.key,
                    token,
                    ttl,
                    created_at: TimeUtils::now(),
                }));
            }
            self.metrics.record_contention();
            if attempt < retry_count {
                let delay = backoff.delay(attempt);
                self.metrics.record_retry(delay);
                tokio::time::sleep(delay).await;
            }
        }

        self.metrics.record_failed();
        debug!(
            "Lock {} still held after {} attempts",
            lock_key,
            u64::from(retry_count) + 1
        );
        Ok(None)
    }

    /// Delete the lock only if `token` still owns it. A wrong token or an
    /// already released lock gives `false`.
    pub async fn release_lock(&self, key: &str, token: &str) -> WardenResult<bool> {
        let released = self
            .store
            .compare_and_delete(&self.lock_key(key), token)
            .await?;
        if released {
            self.metrics.record_released();
            debug!("Released lock {}", key);
        }
        Ok(released)
    }

    /// Reset the lease of a lock `token` owns to `ttl` from now
    pub async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> WardenResult<bool> {
        let extended = self
            .store
            .compare_and_pexpire(&self.lock_key(key), token, ttl)
            .await?;
        if !extended {
            debug!("Extension of {} refused: not the owner", key);
        }
        Ok(extended)
    }

    /// Run `f` under the lock, failing with [`WardenError::DistributedLock`] when
    /// it cannot be acquired. The lock is released however `f` ends.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, f: F) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let mut options = AcquireOptions::new(key);
        options.ttl = ttl;
        let record = self
            .acquire(options)
            .await?
            .ok_or_else(|| WardenError::distributed_lock(key, "held by another owner"))?;

        let guard = self.release_on_drop(key, record.token.clone());
        let result = f().await;
        guard.disarm();

        let released = self
            .release_lock(key, &record.token)
            .await
            .log_error("Failed to release lock");
        if let Ok(false) = released {
            warn!("Lock {} expired before it was released", key);
        }
        result
    }

    /// Guard that releases `key` for `token` if dropped while still armed
    pub(crate) fn release_on_drop(&self, key: &str, token: String) -> ReleaseOnDrop {
        ReleaseOnDrop::new(Arc::clone(&self.store), self.lock_key(key), token)
    }

    pub async fn has_lock(&self, key: &str) -> WardenResult<bool> {
        self.store.exists(&self.lock_key(key)).await
    }

    pub async fn get_lock_ttl(&self, key: &str) -> WardenResult<Option<Duration>> {
        self.store.pttl(&self.lock_key(key)).await
    }
}

/// Releases a lock from `Drop` when the owning future is cancelled
pub(crate) struct ReleaseOnDrop {
    store: Arc<dyn KvStore>,
    lock_key: String,
    token: String,
    armed: bool,
}

impl ReleaseOnDrop {
    pub(crate) fn new(store: Arc<dyn KvStore>, lock_key: String, token: String) -> Self {
        Self {
            store,
            lock_key,
            token,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Without a runtime the TTL reclaims the key
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.compare_and_delete(&lock_key, &token).await {
                warn!("Release of {} after cancellation failed: {}", lock_key, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn manager() -> (InMemoryKvStore, DistributedLockManager) {
        let store = InMemoryKvStore::new("kv-0");
        let manager = DistributedLockManager::new(Arc::new(store.clone()), LockManagerConfig::default());
        (store, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_fails_while_held() {
        let (_, manager) = manager();
        let token = manager
            .acquire_lock(AcquireOptions::new("orders"))
            .await
            .unwrap()
            .expect("first acquire");
        assert_eq!(token.len(), 40);

        let start = Instant::now();
        let second = manager.acquire_lock(AcquireOptions::new("orders")).await.unwrap();
        assert!(second.is_none());
        // 100 + 200 + 400 ms between the four attempts
        assert!(start.elapsed() >= Duration::from_millis(700));
        assert!(start.elapsed() < Duration::from_millis(800));
        assert!(manager.has_lock("orders").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_requires_matching_token() {
        let (store, manager) = manager();
        let token = manager
            .acquire_lock(AcquireOptions::new("orders"))
            .await
            .unwrap()
            .unwrap();

        assert!(!manager.release_lock("orders", "not-the-token").await.unwrap());
        assert_eq!(store.get("lock:orders").await.unwrap(), Some(token.clone()));

        assert!(manager.release_lock("orders", &token).await.unwrap());
        // releasing twice is a harmless no-op
        assert!(!manager.release_lock("orders", &token).await.unwrap());
        assert!(!manager.has_lock("orders").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_cannot_be_released_by_old_owner() {
        let (_, manager) = manager();
        let options = AcquireOptions::new("job").with_ttl(Duration::from_millis(100));
        let old = manager.acquire_lock(options.clone()).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let new = manager.acquire_lock(options).await.unwrap().unwrap();

        assert!(!manager.release_lock("job", &old).await.unwrap());
        assert!(!manager.extend_lock("job", &old, Duration::from_secs(1)).await.unwrap());
        assert!(manager.release_lock("job", &new).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_resets_ttl() {
        let (_, manager) = manager();
        let token = manager
            .acquire_lock(AcquireOptions::new("report").with_ttl(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();

        assert!(manager
            .extend_lock("report", &token, Duration::from_secs(5))
            .await
            .unwrap());
        let ttl = manager.get_lock_ttl("report").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_after_error() {
        let (_, manager) = manager();
        let result: WardenResult<()> = manager
            .with_lock("sync", None, || async { Err(WardenError::internal("boom")) })
            .await;
        assert!(matches!(result, Err(WardenError::Internal(_))));
        assert!(!manager.has_lock("sync").await.unwrap());

        let value = manager.with_lock("sync", None, || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_fails_when_held() {
        let (_, manager) = manager();
        manager
            .acquire_lock(AcquireOptions::new("sync"))
            .await
            .unwrap()
            .unwrap();

        let result = manager
            .with_lock("sync", None, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(WardenError::DistributedLock { key, .. }) if key == "sync"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_with_lock_releases() {
        let (_, manager) = manager();
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_lock("slow", None, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.has_lock("slow").await.unwrap());

        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!manager.has_lock("slow").await.unwrap());
    }
}
