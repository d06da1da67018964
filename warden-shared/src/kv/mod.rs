//! Shared key-value store boundary
//!
//! Distributed locks, Redlock and the semaphore only talk to the store through
//! [`KvStore`]. Every method that combines a check with a mutation must execute
//! as one indivisible step on the store side (a server-side script for Redis,
//! a single critical section for the in-memory store).

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::exception::WardenResult;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKvStore;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Instance name used in logs and quorum diagnostics
    fn name(&self) -> &str;

    /// `SET key value PX ttl NX`; true when the key was created
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> WardenResult<bool>;

    async fn get(&self, key: &str) -> WardenResult<Option<String>>;

    /// Delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> WardenResult<bool>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `expected`
    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> WardenResult<bool>;

    /// Remaining time to live; `None` when the key is missing or never expires
    async fn pttl(&self, key: &str) -> WardenResult<Option<Duration>>;

    async fn exists(&self, key: &str) -> WardenResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// `ZREMRANGEBYSCORE key min max`, inclusive bounds; returns removed count
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> WardenResult<u64>;

    /// Add `member` with `score` only while the set holds fewer than `max_cardinality` members
    async fn zadd_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max_cardinality: u64,
    ) -> WardenResult<bool>;

    async fn zrem(&self, key: &str, member: &str) -> WardenResult<bool>;

    async fn zcard(&self, key: &str) -> WardenResult<u64>;
}
