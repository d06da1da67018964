//! Optimistic locking over an integer `version` column
//!
//! Writers never block: every write names the version it read, and a write
//! against a newer version affects zero rows and surfaces as
//! [`WardenError::OptimisticLock`].

use crate::config::ConfigDefaults;
use crate::exception::{WardenError, WardenResult};
use crate::metrics::LockMetrics;
use crate::relational::{RelationalStore, VersionedRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use warden_util::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisticLockConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for OptimisticLockConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl ConfigDefaults for OptimisticLockConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err("Max delay must be >= base delay".to_string());
        }
        Ok(())
    }
}

/// Passed to the conflict callback each time a write loses to a concurrent one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEvent {
    pub entity: String,
    pub id: String,
    pub expected: i64,
    pub actual: i64,
    /// 0-based attempt that conflicted
    pub attempt: u32,
}

pub type ConflictCallback = Arc<dyn Fn(&ConflictEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct OptimisticUpdateOptions {
    /// Overrides the configured retry budget
    pub max_retries: Option<u32>,
    pub on_conflict: Option<ConflictCallback>,
}

impl std::fmt::Debug for OptimisticUpdateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticUpdateOptions")
            .field("max_retries", &self.max_retries)
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}

impl OptimisticUpdateOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn on_conflict(mut self, callback: impl Fn(&ConflictEvent) + Send + Sync + 'static) -> Self {
        self.on_conflict = Some(Arc::new(callback));
        self
    }
}

/// Versioned reads and writes against one table
pub struct VersionedRecordStore {
    store: Arc<dyn RelationalStore>,
    table: String,
    config: OptimisticLockConfig,
    metrics: LockMetrics,
}

impl std::fmt::Debug for VersionedRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedRecordStore")
            .field("table", &self.table)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VersionedRecordStore {
    pub fn new(store: Arc<dyn RelationalStore>, table: impl Into<String>, config: OptimisticLockConfig) -> Self {
        Self {
            store,
            table: table.into(),
            config,
            metrics: LockMetrics::new("optimistic"),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn not_found(&self, id: &str) -> WardenError {
        WardenError::RecordNotFound {
            entity: self.table.clone(),
            id: id.to_string(),
        }
    }

    fn conflict(&self, id: &str, expected: i64, actual: i64) -> WardenError {
        WardenError::OptimisticLock {
            entity: self.table.clone(),
            id: id.to_string(),
            expected,
            actual,
        }
    }

    pub async fn fetch(&self, id: &str) -> WardenResult<Option<VersionedRecord>> {
        self.store.fetch(&self.table, id).await
    }

    /// One conditional write of `patch` against the version `current` was read at
    pub async fn update_versioned(
        &self,
        current: VersionedRecord,
        patch: &Map<String, Value>,
    ) -> WardenResult<VersionedRecord> {
        let affected = self
            .store
            .update_if_version(&self.table, &current.id, current.version, patch)
            .await?;
        if affected > 0 {
            return Ok(current.patched(patch));
        }

        let actual = self
            .fetch(&current.id)
            .await?
            .ok_or_else(|| self.not_found(&current.id))?
            .version;
        Err(self.conflict(&current.id, current.version, actual))
    }

    /// Apply `patch` at the current version, re-reading and retrying on conflict
    pub async fn optimistic_update(
        &self,
        id: &str,
        patch: Map<String, Value>,
        options: OptimisticUpdateOptions,
    ) -> WardenResult<VersionedRecord> {
        self.optimistic_update_with(id, options, |_| Ok(patch.clone()))
            .await
    }

    /// Read-modify-write: `build_patch` sees the freshly read record on every attempt
    pub async fn optimistic_update_with<F>(
        &self,
        id: &str,
        options: OptimisticUpdateOptions,
        mut build_patch: F,
    ) -> WardenResult<VersionedRecord>
    where
        F: FnMut(&VersionedRecord) -> WardenResult<Map<String, Value>>,
    {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let backoff = Backoff::doubling(Duration::from_millis(self.config.base_delay_ms))
            .with_max(Duration::from_millis(self.config.max_delay_ms));
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            let current = self.fetch(id).await?.ok_or_else(|| self.not_found(id))?;
            let patch = build_patch(&current)?;

            match self.update_versioned(current, &patch).await {
                Ok(updated) => {
                    self.metrics.record_acquired(started.elapsed());
                    debug!("Updated {} {} to version {}", self.table, id, updated.version);
                    return Ok(updated);
                }
                Err(WardenError::OptimisticLock { expected, actual, .. }) => {
                    self.metrics.record_contention();
                    if let Some(callback) = &options.on_conflict {
                        callback(&ConflictEvent {
                            entity: self.table.clone(),
                            id: id.to_string(),
                            expected,
                            actual,
                            attempt,
                        });
                    }
                    if attempt >= max_retries {
                        self.metrics.record_failed();
                        warn!(
                            "Giving up on {} {} after {} conflicting attempts",
                            self.table,
                            id,
                            attempt + 1
                        );
                        return Err(self.conflict(id, expected, actual));
                    }
                    let delay = backoff.jittered_delay(attempt, 0.5);
                    self.metrics.record_retry(delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Check a record read elsewhere against the version the caller expects
    pub fn validate_optimistic_lock(&self, record: &VersionedRecord, expected_version: i64) -> WardenResult<()> {
        if record.version == expected_version {
            Ok(())
        } else {
            Err(self.conflict(&record.id, expected_version, record.version))
        }
    }

    /// Atomically set `field` when it still holds `expected_value` at `version`.
    /// Returns `false` instead of failing so callers can loop cheaply.
    pub async fn compare_and_swap(
        &self,
        id: &str,
        field: &str,
        expected_value: &Value,
        new_value: &Value,
        version: i64,
    ) -> WardenResult<bool> {
        let affected = self
            .store
            .compare_and_swap_field(&self.table, id, field, expected_value, new_value, version)
            .await?;
        Ok(affected > 0)
    }

    /// Reset the version to 0; `false` when the record does not exist
    pub async fn reset_version(&self, id: &str) -> WardenResult<bool> {
        let affected = self.store.reset_version(&self.table, id).await?;
        if affected > 0 {
            warn!("Version of {} {} reset to 0", self.table, id);
        }
        Ok(affected > 0)
    }
}
