//! Quorum lock over independent key-value instances (Redlock)
//!
//! A lock counts as held when a majority of instances accepted the same random
//! token and the time left on the lease, after subtracting the time spent
//! acquiring and a clock-drift allowance, is still positive.

use super::lock_manager::ReleaseOnDrop;
use crate::config::ConfigDefaults;
use crate::exception::{WardenError, WardenResult};
use crate::kv::KvStore;
use crate::metrics::LockMetrics;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_util::RngUtils;

/// Fixed part of the drift allowance, on top of `ttl * clock_drift_factor`
const DRIFT_FLOOR: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedlockConfig {
    pub clock_drift_factor: f64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Upper bound of the random delay added to each retry
    pub retry_jitter_ms: u64,
    pub key_prefix: String,
}

impl Default for RedlockConfig {
    fn default() -> Self {
        Self {
            clock_drift_factor: 0.01,
            retry_count: 3,
            retry_delay_ms: 200,
            retry_jitter_ms: 200,
            key_prefix: "lock:".to_string(),
        }
    }
}

impl ConfigDefaults for RedlockConfig {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..1.0).contains(&self.clock_drift_factor) {
            return Err("Clock drift factor must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// A quorum lock; `validity` is how long the holder may assume exclusivity
#[derive(Debug, Clone, PartialEq)]
pub struct RedlockLease {
    pub key: String,
    pub token: String,
    pub validity: Duration,
    pub instances_locked: usize,
}

pub struct RedlockCoordinator {
    instances: Vec<Arc<dyn KvStore>>,
    config: RedlockConfig,
    metrics: LockMetrics,
}

impl std::fmt::Debug for RedlockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.instances.iter().map(|i| i.name()).collect();
        f.debug_struct("RedlockCoordinator")
            .field("instances", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl RedlockCoordinator {
    pub fn new(instances: Vec<Arc<dyn KvStore>>, config: RedlockConfig) -> WardenResult<Self> {
        if instances.is_empty() {
            return Err(WardenError::configuration(
                "Redlock needs at least one instance",
            ));
        }
        config.validate().map_err(WardenError::configuration)?;
        info!("Redlock over {} instances, quorum {}", instances.len(), instances.len() / 2 + 1);
        Ok(Self {
            instances,
            config,
            metrics: LockMetrics::new("redlock"),
        })
    }

    pub fn quorum(&self) -> usize {
        self.instances.len() / 2 + 1
    }

    /// Clock-drift allowance for a lease of `ttl`
    pub fn drift(&self, ttl: Duration) -> Duration {
        let micros = (ttl.as_micros() as f64 * self.config.clock_drift_factor).round();
        Duration::from_micros(micros as u64).saturating_add(DRIFT_FLOOR)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Time left on a lease after `elapsed`, if any
    fn validity(&self, ttl: Duration, elapsed: Duration) -> Option<Duration> {
        ttl.checked_sub(elapsed.saturating_add(self.drift(ttl)))
            .filter(|left| !left.is_zero())
    }

    /// Run `op` against every instance concurrently and count the successes.
    /// An instance that errors counts as a refusal.
    async fn on_all<'a, F, Fut>(&'a self, action: &str, op: F) -> usize
    where
        F: Fn(&'a Arc<dyn KvStore>) -> Fut,
        Fut: Future<Output = WardenResult<bool>>,
    {
        let results = join_all(self.instances.iter().map(op)).await;
        results
            .into_iter()
            .zip(&self.instances)
            .filter(|(result, instance)| match result {
                Ok(accepted) => *accepted,
                Err(e) => {
                    warn!("Redlock {} on {} failed: {}", action, instance.name(), e);
                    false
                }
            })
            .count()
    }

    /// Try to lock `key` on a quorum of instances within the validity window
    pub async fn acquire_lock(&self, key: &str, ttl: Duration) -> WardenResult<Option<RedlockLease>> {
        let lock_key = self.lock_key(key);
        let overall = Instant::now();

        for attempt in 0..=self.config.retry_count {
            let token = RngUtils::random_token();
            let started = Instant::now();
            let locked = self
                .on_all("acquire", |instance| instance.set_nx_px(&lock_key, &token, ttl))
                .await;
            let elapsed = started.elapsed();

            match self.validity(ttl, elapsed) {
                Some(validity) if locked >= self.quorum() => {
                    self.metrics.record_acquired(overall.elapsed());
                    debug!(
                        "Redlock {} held on {}/{} instances, valid for {:?}",
                        key,
                        locked,
                        self.instances.len(),
                        validity
                    );
                    return Ok(Some(RedlockLease {
                        key: key.to_string(),
                        token,
                        validity,
                        instances_locked: locked,
                    }));
                }
                validity => {
                    debug!(
                        "Redlock {} attempt {} failed: {}/{} instances, validity {:?}",
                        key,
                        attempt + 1,
                        locked,
                        self.quorum(),
                        validity
                    );
                }
            }

            self.metrics.record_contention();
            self.unlock_all(&lock_key, &token).await;

            if attempt < self.config.retry_count {
                let jitter = RngUtils::random_u64_up_to(self.config.retry_jitter_ms);
                let delay = Duration::from_millis(self.config.retry_delay_ms.saturating_add(jitter));
                self.metrics.record_retry(delay);
                tokio::time::sleep(delay).await;
            }
        }

        self.metrics.record_failed();
        Ok(None)
    }

    async fn unlock_all(&self, lock_key: &str, token: &str) -> usize {
        self.on_all("release", |instance| instance.compare_and_delete(lock_key, token))
            .await
    }

    /// Release on every instance, tolerating failures; returns how many released
    pub async fn release_lock(&self, lease: &RedlockLease) -> usize {
        let released = self.unlock_all(&self.lock_key(&lease.key), &lease.token).await;
        self.metrics.record_released();
        debug!(
            "Redlock {} released on {}/{} instances",
            lease.key,
            released,
            self.instances.len()
        );
        released
    }

    /// Reset the lease to `ttl` on every instance still holding the token.
    /// Succeeds under the same quorum and validity rule as acquisition.
    pub async fn extend_lock(&self, lease: &RedlockLease, ttl: Duration) -> Option<RedlockLease> {
        let lock_key = self.lock_key(&lease.key);
        let started = Instant::now();
        let extended = self
            .on_all("extend", |instance| {
                instance.compare_and_pexpire(&lock_key, &lease.token, ttl)
            })
            .await;

        let validity = self.validity(ttl, started.elapsed())?;
        if extended < self.quorum() {
            warn!(
                "Redlock {} extension reached only {}/{} instances",
                lease.key,
                extended,
                self.quorum()
            );
            return None;
        }
        Some(RedlockLease {
            key: lease.key.clone(),
            token: lease.token.clone(),
            validity,
            instances_locked: extended,
        })
    }

    /// Run `f` under a quorum lock; [`WardenError::DistributedLock`] when none is obtained
    pub async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> WardenResult<T>
    where
        F: FnOnce(RedlockLease) -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let lease = self.acquire_lock(key, ttl).await?.ok_or_else(|| {
            WardenError::distributed_lock(key, format!("no quorum of {} instances", self.quorum()))
        })?;

        let lock_key = self.lock_key(key);
        let guards: Vec<ReleaseOnDrop> = self
            .instances
            .iter()
            .map(|instance| ReleaseOnDrop::new(Arc::clone(instance), lock_key.clone(), lease.token.clone()))
            .collect();
        let result = f(lease.clone()).await;
        guards.into_iter().for_each(ReleaseOnDrop::disarm);

        self.release_lock(&lease).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn cluster(n: usize) -> (Vec<InMemoryKvStore>, RedlockCoordinator) {
        let stores: Vec<InMemoryKvStore> = (0..n)
            .map(|i| InMemoryKvStore::new(format!("kv-{i}")))
            .collect();
        let instances = stores
            .iter()
            .map(|s| Arc::new(s.clone()) as Arc<dyn KvStore>)
            .collect();
        let config = RedlockConfig {
            retry_count: 0,
            ..Default::default()
        };
        (stores, RedlockCoordinator::new(instances, config).unwrap())
    }

    #[test]
    fn test_quorum_and_drift() {
        let (_, redlock) = cluster(5);
        assert_eq!(redlock.quorum(), 3);
        assert_eq!(redlock.drift(Duration::from_secs(10)), Duration::from_millis(102));

        assert!(RedlockCoordinator::new(Vec::new(), RedlockConfig::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_all_instances() {
        let (stores, redlock) = cluster(5);
        let lease = redlock
            .acquire_lock("invoice", Duration::from_secs(10))
            .await
            .unwrap()
            .expect("quorum");
        assert_eq!(lease.instances_locked, 5);
        assert!(lease.validity <= Duration::from_millis(9_898));

        for store in &stores {
            assert_eq!(store.get("lock:invoice").await.unwrap(), Some(lease.token.clone()));
        }
        assert_eq!(redlock.release_lock(&lease).await, 5);
        assert!(!stores[0].exists("lock:invoice").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_instances_down_still_acquires() {
        let (stores, redlock) = cluster(5);
        stores[0].set_available(false);
        stores[1].set_available(false);

        let lease = redlock
            .acquire_lock("invoice", Duration::from_secs(10))
            .await
            .unwrap()
            .expect("quorum of 3");
        assert_eq!(lease.instances_locked, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_instances_down_fails_and_cleans_up() {
        let (stores, redlock) = cluster(5);
        for store in &stores[..3] {
            store.set_available(false);
        }

        let lease = redlock
            .acquire_lock("invoice", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(lease.is_none());
        for store in &stores[3..] {
            assert!(!store.exists("lock:invoice").await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_acquisition_exhausts_validity() {
        let (stores, redlock) = cluster(3);
        for store in &stores {
            store.set_latency(Duration::from_millis(150));
        }

        let lease = redlock
            .acquire_lock("invoice", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_competing_acquire_fails() {
        let (_, redlock) = cluster(3);
        let first = redlock
            .acquire_lock("invoice", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = redlock
            .acquire_lock("invoice", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_and_with_lock() {
        let (stores, redlock) = cluster(3);
        let lease = redlock
            .acquire_lock("invoice", Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        let extended = redlock
            .extend_lock(&lease, Duration::from_secs(30))
            .await
            .expect("extended");
        assert!(extended.validity > Duration::from_secs(29));
        redlock.release_lock(&extended).await;

        let value = redlock
            .with_lock("invoice", Duration::from_secs(5), |lease| async move {
                Ok(lease.instances_locked)
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert!(!stores[0].exists("lock:invoice").await.unwrap());
    }
}
