//! Configuration loading and validation shared by every lock component

use crate::deadlock::DeadlockRetryConfig;
use crate::distributed::{DistributedMutexConfig, LockManagerConfig, RedlockConfig, SemaphoreConfig};
use crate::escalation::EscalationConfig;
use crate::exception::{WardenError, WardenResult};
use crate::optimistic::OptimisticLockConfig;
use crate::pessimistic::RowLockConfig;
use crate::relational::InMemoryDatabaseConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Common configuration trait that provides default validation
pub trait ConfigDefaults {
    /// Validate the configuration settings
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Get configuration source description for debugging
    fn config_source(&self) -> &'static str {
        "default"
    }
}

/// Read `key` from the environment, falling back to `default` when unset or unparsable
pub fn get_env_or_default<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Every component configuration in one document.
///
/// ```toml
/// [optimistic]
/// max_retries = 5
///
/// [semaphore]
/// max_concurrent = 3
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub optimistic: OptimisticLockConfig,
    pub row_lock: RowLockConfig,
    pub escalation: EscalationConfig,
    pub lock_manager: LockManagerConfig,
    pub redlock: RedlockConfig,
    pub semaphore: SemaphoreConfig,
    pub distributed_mutex: DistributedMutexConfig,
    pub deadlock_retry: DeadlockRetryConfig,
    pub in_memory_database: InMemoryDatabaseConfig,
}

impl WardenConfig {
    pub fn from_toml(content: &str) -> WardenResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            WardenError::configuration(format!("Failed to parse TOML config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> WardenResult<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| {
            WardenError::configuration(format!("Failed to parse JSON config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` file, anything else is parsed as JSON
    pub async fn from_file<P: AsRef<Path>>(path: P) -> WardenResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            WardenError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!("Loading warden config from {}", path.display());

        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    /// Defaults overridden by `{PREFIX}_*` environment variables,
    /// e.g. `WARDEN_SEMAPHORE_MAX_CONCURRENT=3`
    pub fn from_env(prefix: &str) -> WardenResult<Self> {
        let key = |name: &str| format!("{}_{}", prefix, name);
        let defaults = Self::default();

        let config = Self {
            optimistic: OptimisticLockConfig {
                max_retries: get_env_or_default(
                    &key("OPTIMISTIC_MAX_RETRIES"),
                    defaults.optimistic.max_retries,
                ),
                base_delay_ms: get_env_or_default(
                    &key("OPTIMISTIC_BASE_DELAY_MS"),
                    defaults.optimistic.base_delay_ms,
                ),
                max_delay_ms: get_env_or_default(
                    &key("OPTIMISTIC_MAX_DELAY_MS"),
                    defaults.optimistic.max_delay_ms,
                ),
            },
            row_lock: RowLockConfig {
                lock_wait_timeout_ms: get_env_or_default(
                    &key("ROW_LOCK_WAIT_TIMEOUT_MS"),
                    defaults.row_lock.lock_wait_timeout_ms,
                ),
                queue_poll_interval_ms: get_env_or_default(
                    &key("ROW_LOCK_QUEUE_POLL_INTERVAL_MS"),
                    defaults.row_lock.queue_poll_interval_ms,
                ),
            },
            escalation: EscalationConfig {
                row_lock_threshold: get_env_or_default(
                    &key("ESCALATION_ROW_LOCK_THRESHOLD"),
                    defaults.escalation.row_lock_threshold,
                ),
                table_lock_after_threshold: get_env_or_default(
                    &key("ESCALATION_TABLE_LOCK_AFTER_THRESHOLD"),
                    defaults.escalation.table_lock_after_threshold,
                ),
                warn_on_escalation: get_env_or_default(
                    &key("ESCALATION_WARN"),
                    defaults.escalation.warn_on_escalation,
                ),
            },
            lock_manager: LockManagerConfig {
                default_ttl_ms: get_env_or_default(
                    &key("LOCK_DEFAULT_TTL_MS"),
                    defaults.lock_manager.default_ttl_ms,
                ),
                retry_count: get_env_or_default(
                    &key("LOCK_RETRY_COUNT"),
                    defaults.lock_manager.retry_count,
                ),
                retry_delay_ms: get_env_or_default(
                    &key("LOCK_RETRY_DELAY_MS"),
                    defaults.lock_manager.retry_delay_ms,
                ),
                key_prefix: get_env_or_default(
                    &key("LOCK_KEY_PREFIX"),
                    defaults.lock_manager.key_prefix,
                ),
            },
            redlock: RedlockConfig {
                clock_drift_factor: get_env_or_default(
                    &key("REDLOCK_CLOCK_DRIFT_FACTOR"),
                    defaults.redlock.clock_drift_factor,
                ),
                retry_count: get_env_or_default(
                    &key("REDLOCK_RETRY_COUNT"),
                    defaults.redlock.retry_count,
                ),
                retry_delay_ms: get_env_or_default(
                    &key("REDLOCK_RETRY_DELAY_MS"),
                    defaults.redlock.retry_delay_ms,
                ),
                retry_jitter_ms: get_env_or_default(
                    &key("REDLOCK_RETRY_JITTER_MS"),
                    defaults.redlock.retry_jitter_ms,
                ),
                key_prefix: get_env_or_default(
                    &key("REDLOCK_KEY_PREFIX"),
                    defaults.redlock.key_prefix,
                ),
            },
            semaphore: SemaphoreConfig {
                max_concurrent: get_env_or_default(
                    &key("SEMAPHORE_MAX_CONCURRENT"),
                    defaults.semaphore.max_concurrent,
                ),
                timeout_ms: get_env_or_default(
                    &key("SEMAPHORE_TIMEOUT_MS"),
                    defaults.semaphore.timeout_ms,
                ),
                poll_interval_ms: get_env_or_default(
                    &key("SEMAPHORE_POLL_INTERVAL_MS"),
                    defaults.semaphore.poll_interval_ms,
                ),
                key_prefix: get_env_or_default(
                    &key("SEMAPHORE_KEY_PREFIX"),
                    defaults.semaphore.key_prefix,
                ),
            },
            distributed_mutex: DistributedMutexConfig {
                ttl_ms: get_env_or_default(
                    &key("MUTEX_TTL_MS"),
                    defaults.distributed_mutex.ttl_ms,
                ),
                poll_interval_ms: get_env_or_default(
                    &key("MUTEX_POLL_INTERVAL_MS"),
                    defaults.distributed_mutex.poll_interval_ms,
                ),
            },
            deadlock_retry: DeadlockRetryConfig {
                max_retries: get_env_or_default(
                    &key("DEADLOCK_MAX_RETRIES"),
                    defaults.deadlock_retry.max_retries,
                ),
                initial_delay_ms: get_env_or_default(
                    &key("DEADLOCK_INITIAL_DELAY_MS"),
                    defaults.deadlock_retry.initial_delay_ms,
                ),
                max_delay_ms: get_env_or_default(
                    &key("DEADLOCK_MAX_DELAY_MS"),
                    defaults.deadlock_retry.max_delay_ms,
                ),
                backoff_multiplier: get_env_or_default(
                    &key("DEADLOCK_BACKOFF_MULTIPLIER"),
                    defaults.deadlock_retry.backoff_multiplier,
                ),
                jitter: get_env_or_default(
                    &key("DEADLOCK_JITTER"),
                    defaults.deadlock_retry.jitter,
                ),
            },
            in_memory_database: InMemoryDatabaseConfig {
                lock_wait_timeout_ms: get_env_or_default(
                    &key("DB_LOCK_WAIT_TIMEOUT_MS"),
                    defaults.in_memory_database.lock_wait_timeout_ms,
                ),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section, naming the first one that fails
    pub fn validate(&self) -> WardenResult<()> {
        let sections: [(&str, &dyn ConfigDefaults); 8] = [
            ("optimistic", &self.optimistic),
            ("row_lock", &self.row_lock),
            ("escalation", &self.escalation),
            ("lock_manager", &self.lock_manager),
            ("redlock", &self.redlock),
            ("semaphore", &self.semaphore),
            ("distributed_mutex", &self.distributed_mutex),
            ("deadlock_retry", &self.deadlock_retry),
        ];
        for (name, section) in sections {
            section
                .validate()
                .map_err(|e| WardenError::configuration(format!("[{}] {}", name, e)))?;
        }
        Ok(())
    }
}
