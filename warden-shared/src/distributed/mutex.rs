use super::lock_manager::{AcquireOptions, DistributedLockManager, ReleaseOnDrop};
use crate::config::ConfigDefaults;
use crate::error_handling::ErrorLog;
use crate::exception::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedMutexConfig {
    pub ttl_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DistributedMutexConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            poll_interval_ms: 50,
        }
    }
}

impl ConfigDefaults for DistributedMutexConfig {
    fn validate(&self) -> Result<(), String> {
        if self.ttl_ms == 0 || self.poll_interval_ms == 0 {
            return Err("Mutex TTL and poll interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// [`LocalMutex`](crate::local::LocalMutex)-shaped lock on one key of a
/// [`DistributedLockManager`]. Waiting is a poll loop, so there is no FIFO order.
#[derive(Debug)]
pub struct DistributedMutex {
    manager: DistributedLockManager,
    key: String,
    config: DistributedMutexConfig,
    token: Mutex<Option<String>>,
}

impl DistributedMutex {
    pub fn new(manager: DistributedLockManager, key: impl Into<String>, config: DistributedMutexConfig) -> Self {
        Self {
            manager,
            key: key.into(),
            config,
            token: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Poll until the key is ours or `timeout` passes; no timeout polls forever
    pub async fn acquire(&self, timeout: Option<Duration>) -> WardenResult<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let options = AcquireOptions::new(self.key.clone())
            .with_ttl(Duration::from_millis(self.config.ttl_ms))
            .with_retries(0, Duration::ZERO);

        loop {
            if let Some(token) = self.manager.acquire_lock(options.clone()).await? {
                *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
                return Ok(true);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("Gave up on distributed mutex {}", self.key);
                        return Ok(false);
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Release if this instance holds the key; `false` otherwise
    pub async fn release(&self) -> WardenResult<bool> {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match token {
            Some(token) => self.manager.release_lock(&self.key, &token).await,
            None => Ok(false),
        }
    }

    /// Run `f` holding the mutex. The key is released however `f` ends,
    /// including when this future is dropped, and `f`'s result wins over a failed release.
    pub async fn with_lock<T, F, Fut>(&self, timeout: Option<Duration>, f: F) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        if !self.acquire(timeout).await? {
            return Err(WardenError::distributed_lock(
                self.key.clone(),
                "timed out waiting for the mutex",
            ));
        }
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| WardenError::internal(format!("mutex {} lost its token", self.key)))?;

        let mut guard = HeldGuard {
            slot: &self.token,
            release: Some(self.manager.release_on_drop(&self.key, token)),
        };
        let result = f().await;
        if let Some(release) = guard.release.take() {
            release.disarm();
        }
        drop(guard);

        if let Ok(false) = self.release().await.log_error("Failed to release distributed mutex") {
            debug!("Distributed mutex {} expired before it was released", self.key);
        }
        result
    }
}

/// Forgets the held token and releases the key when `with_lock` is cancelled
struct HeldGuard<'a> {
    slot: &'a Mutex<Option<String>>,
    release: Option<ReleaseOnDrop>,
}

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        if self.release.is_some() {
            self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
    }
}
