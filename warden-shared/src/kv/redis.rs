//! Redis-backed [`KvStore`]; the compare-then-act operations run as Lua scripts

use super::KvStore;
use crate::error_handling::ErrorConverter;
use crate::exception::WardenResult;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use tracing::info;
use warden_util::TimeUtils;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const ZADD_BOUNDED: &str = r#"
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

/// One Redis instance. Cloning shares the multiplexed connection.
#[derive(Clone)]
pub struct RedisKvStore {
    name: String,
    connection: MultiplexedConnection,
    compare_and_delete: Script,
    compare_and_pexpire: Script,
    zadd_bounded: Script,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/`) and verify it with PING
    pub async fn connect(url: &str) -> WardenResult<Self> {
        let client = redis::Client::open(url).store_context("Invalid redis url")?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .store_context_with(|| format!("Failed to connect to {url}"))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .store_context_with(|| format!("PING {url}"))?;

        info!("Connected to redis instance {}", url);
        Ok(Self {
            name: url.to_string(),
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_pexpire: Script::new(COMPARE_AND_PEXPIRE),
            zadd_bounded: Script::new(ZADD_BOUNDED),
        })
    }

    fn score_arg(score: f64) -> String {
        if score == f64::NEG_INFINITY {
            "-inf".to_string()
        } else if score == f64::INFINITY {
            "+inf".to_string()
        } else {
            score.to_string()
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> WardenResult<bool> {
        let mut conn = self.connection.clone();
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(TimeUtils::duration_millis(ttl).max(1))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .store_context_with(|| format!("SET {key} NX PX"))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> WardenResult<Option<String>> {
        let mut conn = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .store_context_with(|| format!("GET {key}"))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> WardenResult<bool> {
        let mut conn = self.connection.clone();
        let deleted = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .store_context_with(|| format!("compare-and-delete {key}"))?;
        Ok(deleted == 1)
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> WardenResult<bool> {
        let mut conn = self.connection.clone();
        let updated = self
            .compare_and_pexpire
            .key(key)
            .arg(expected)
            .arg(TimeUtils::duration_millis(ttl).max(1))
            .invoke_async::<_, i64>(&mut conn)
            .await
            .store_context_with(|| format!("compare-and-pexpire {key}"))?;
        Ok(updated == 1)
    }

    async fn pttl(&self, key: &str) -> WardenResult<Option<Duration>> {
        let mut conn = self.connection.clone();
        let millis = redis::cmd("PTTL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .store_context_with(|| format!("PTTL {key}"))?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn exists(&self, key: &str) -> WardenResult<bool> {
        let mut conn = self.connection.clone();
        let count = redis::cmd("EXISTS")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .store_context_with(|| format!("EXISTS {key}"))?;
        Ok(count > 0)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> WardenResult<u64> {
        let mut conn = self.connection.clone();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(Self::score_arg(min))
            .arg(Self::score_arg(max))
            .query_async::<_, u64>(&mut conn)
            .await
            .store_context_with(|| format!("ZREMRANGEBYSCORE {key}"))
    }

    async fn zadd_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max_cardinality: u64,
    ) -> WardenResult<bool> {
        let mut conn = self.connection.clone();
        let added = self
            .zadd_bounded
            .key(key)
            .arg(Self::score_arg(score))
            .arg(member)
            .arg(max_cardinality)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .store_context_with(|| format!("bounded ZADD {key}"))?;
        Ok(added == 1)
    }

    async fn zrem(&self, key: &str, member: &str) -> WardenResult<bool> {
        let mut conn = self.connection.clone();
        let removed = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .store_context_with(|| format!("ZREM {key}"))?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> WardenResult<u64> {
        let mut conn = self.connection.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await
            .store_context_with(|| format!("ZCARD {key}"))
    }
}
