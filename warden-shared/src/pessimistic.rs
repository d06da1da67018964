//! Pessimistic row and table locking through a live [`StoreTransaction`]
//!
//! Every lock taken here belongs to the transaction and is released by the
//! store on commit or rollback. Multi-row acquisition always walks ids in
//! sorted order so two batches over the same rows can never wait on each
//! other in a cycle.

use crate::config::ConfigDefaults;
use crate::escalation::LockEscalationMonitor;
use crate::exception::{WardenError, WardenResult};
use crate::metrics::LockMetrics;
use crate::relational::{
    LockWait, RowFilter, RowLockMode, StoreTransaction, TableLockMode, VersionedRecord,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RowLockConfig {
    pub lock_wait_timeout_ms: u64,
    pub queue_poll_interval_ms: u64,
}

impl Default for RowLockConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 5_000,
            queue_poll_interval_ms: 100,
        }
    }
}

impl ConfigDefaults for RowLockConfig {
    fn validate(&self) -> Result<(), String> {
        if self.queue_poll_interval_ms == 0 {
            return Err("Queue poll interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowLockOptions {
    /// Lock-wait limit; the configured default when unset
    pub timeout: Option<Duration>,
    pub skip_locked: bool,
    pub nowait: bool,
}

impl RowLockOptions {
    pub fn skip_locked() -> Self {
        Self {
            skip_locked: true,
            ..Default::default()
        }
    }

    pub fn nowait() -> Self {
        Self {
            nowait: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `skip_locked` wins over `nowait`
    fn lock_wait(&self, default_timeout: Duration) -> LockWait {
        if self.skip_locked {
            LockWait::SkipLocked
        } else if self.nowait {
            LockWait::NoWait
        } else {
            LockWait::Block(self.timeout.unwrap_or(default_timeout))
        }
    }
}

/// Outcome of [`RowLockCoordinator::acquire_multiple_row_locks`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowLockBatch {
    /// Rows locked individually, in acquisition order
    pub locked: Vec<VersionedRecord>,
    /// Ids passed over under `skip_locked`
    pub skipped: Vec<String>,
    /// Ids covered by the escalated table lock instead of a row lock
    pub covered_by_table: Vec<String>,
    pub escalated: bool,
}

impl RowLockBatch {
    pub fn locked_ids(&self) -> Vec<&str> {
        self.locked.iter().map(|record| record.id.as_str()).collect()
    }
}

/// Row lock helpers bound to one table
pub struct RowLockCoordinator {
    table: String,
    config: RowLockConfig,
    monitor: Option<Arc<LockEscalationMonitor>>,
    /// Rows counted against the monitor, per transaction id
    tracked: DashMap<String, HashSet<String>>,
    metrics: LockMetrics,
}

impl std::fmt::Debug for RowLockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLockCoordinator")
            .field("table", &self.table)
            .field("config", &self.config)
            .field("monitored", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

impl RowLockCoordinator {
    pub fn new(table: impl Into<String>, config: RowLockConfig) -> Self {
        Self {
            table: table.into(),
            config,
            monitor: None,
            tracked: DashMap::new(),
            metrics: LockMetrics::new("row"),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<LockEscalationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_wait_timeout_ms)
    }

    fn resource(&self, id: &str) -> String {
        format!("{}:{}", self.table, id)
    }

    /// Count a granted row lock once per transaction; `false` when the monitor says to escalate
    fn track(&self, tx: &dyn StoreTransaction, id: &str) -> bool {
        let Some(monitor) = &self.monitor else {
            return true;
        };
        let newly_held = self
            .tracked
            .entry(tx.id().to_string())
            .or_default()
            .insert(id.to_string());
        !newly_held || monitor.track_row_lock(&self.table)
    }

    fn untrack<'a>(&self, tx_id: &str, ids: impl IntoIterator<Item = &'a str>) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let mut released = 0;
        if let Some(mut held) = self.tracked.get_mut(tx_id) {
            for id in ids {
                if held.remove(id) {
                    released += 1;
                }
            }
        }
        self.tracked.remove_if(tx_id, |_, held| held.is_empty());
        for _ in 0..released {
            monitor.release_row_lock(&self.table);
        }
    }

    /// Exclusive lock on one row. `Ok(None)` only under `skip_locked`.
    pub async fn acquire_row_lock_for_update(
        &self,
        id: &str,
        tx: &dyn StoreTransaction,
        options: RowLockOptions,
    ) -> WardenResult<Option<VersionedRecord>> {
        let started = Instant::now();
        let wait = options.lock_wait(self.default_timeout());
        let result = tx
            .lock_row(&self.table, id, RowLockMode::Exclusive, wait)
            .await;

        match result {
            Ok(Some(record)) => {
                self.metrics.record_acquired(started.elapsed());
                self.track(tx, id);
                debug!("{} locked {} for update", tx.id(), self.resource(id));
                Ok(Some(record))
            }
            Ok(None) => {
                self.metrics.record_contention();
                Ok(None)
            }
            Err(WardenError::RecordNotFound { .. }) => {
                self.metrics.record_failed();
                Err(WardenError::lock_timeout(
                    self.resource(id),
                    "row does not exist",
                ))
            }
            Err(e) => {
                self.metrics.record_failed();
                Err(e)
            }
        }
    }

    /// `FOR SHARE`: concurrent readers allowed, writers blocked
    pub async fn acquire_shared_lock(
        &self,
        id: &str,
        tx: &dyn StoreTransaction,
    ) -> WardenResult<VersionedRecord> {
        let started = Instant::now();
        let wait = LockWait::Block(self.default_timeout());
        let record = match tx.lock_row(&self.table, id, RowLockMode::Shared, wait).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(WardenError::internal(format!(
                    "blocking shared lock on {} returned no row",
                    self.resource(id)
                )))
            }
            Err(WardenError::RecordNotFound { .. }) => {
                self.metrics.record_failed();
                return Err(WardenError::lock_timeout(self.resource(id), "row does not exist"));
            }
            Err(e) => {
                self.metrics.record_failed();
                return Err(e);
            }
        };
        self.metrics.record_acquired(started.elapsed());
        self.track(tx, id);
        Ok(record)
    }

    /// Lock every id in sorted order, one at a time.
    ///
    /// With an escalation monitor configured for `table_lock_after_threshold`,
    /// the first row that reaches the threshold triggers an `EXCLUSIVE` table
    /// lock and the remaining ids are covered by it. On error the monitor
    /// counts taken by this call are given back; the row locks themselves stay
    /// with the transaction until it ends.
    pub async fn acquire_multiple_row_locks<S: AsRef<str>>(
        &self,
        ids: &[S],
        tx: &dyn StoreTransaction,
        options: RowLockOptions,
    ) -> WardenResult<RowLockBatch> {
        let mut ordered: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        ordered.sort_unstable();
        ordered.dedup();

        let escalate_on_signal = self
            .monitor
            .as_ref()
            .map_or(false, |monitor| monitor.config().table_lock_after_threshold);

        let mut batch = RowLockBatch::default();
        for id in ordered {
            if batch.escalated {
                batch.covered_by_table.push(id.to_string());
                continue;
            }

            let wait = options.lock_wait(self.default_timeout());
            let locked = match tx.lock_row(&self.table, id, RowLockMode::Exclusive, wait).await {
                Ok(locked) => locked,
                Err(e) => {
                    self.untrack(tx.id(), batch.locked_ids());
                    self.metrics.record_failed();
                    return Err(match e {
                        WardenError::RecordNotFound { .. } => {
                            WardenError::lock_timeout(self.resource(id), "row does not exist")
                        }
                        other => other,
                    });
                }
            };

            let Some(record) = locked else {
                batch.skipped.push(id.to_string());
                continue;
            };
            batch.locked.push(record);
            if !self.track(tx, id) && escalate_on_signal {
                if let Err(e) = self
                    .acquire_table_lock(&self.table, TableLockMode::Exclusive, tx)
                    .await
                {
                    self.untrack(tx.id(), batch.locked_ids());
                    return Err(e);
                }
                info!(
                    "{} escalated to a table lock on {} after {} rows",
                    tx.id(),
                    self.table,
                    batch.locked.len()
                );
                batch.escalated = true;
            }
        }

        debug!(
            "{} locked {} rows of {} ({} skipped, {} under table lock)",
            tx.id(),
            batch.locked.len(),
            self.table,
            batch.skipped.len(),
            batch.covered_by_table.len()
        );
        Ok(batch)
    }

    /// Give back the escalation counts of a batch before its transaction ends
    pub fn release_batch(&self, batch: &RowLockBatch, tx: &dyn StoreTransaction) {
        self.untrack(tx.id(), batch.locked_ids());
    }

    /// Give back every escalation count held for a transaction
    pub fn release_tracked(&self, tx_id: &str) {
        let Some((_, held)) = self.tracked.remove(tx_id) else {
            return;
        };
        if let Some(monitor) = &self.monitor {
            for _ in 0..held.len() {
                monitor.release_row_lock(&self.table);
            }
        }
    }

    /// Number of transactions with row locks counted against the monitor
    pub fn tracked_transactions(&self) -> usize {
        self.tracked.len()
    }

    /// Commit `tx`, releasing its row locks and their escalation counts
    pub async fn commit(&self, tx: &dyn StoreTransaction) -> WardenResult<()> {
        let result = tx.commit().await;
        self.release_tracked(tx.id());
        result
    }

    /// Roll back `tx`, releasing its row locks and their escalation counts
    pub async fn rollback(&self, tx: &dyn StoreTransaction) -> WardenResult<()> {
        let result = tx.rollback().await;
        self.release_tracked(tx.id());
        result
    }

    pub async fn acquire_table_lock(
        &self,
        table: &str,
        mode: TableLockMode,
        tx: &dyn StoreTransaction,
    ) -> WardenResult<()> {
        let started = Instant::now();
        match tx.lock_table(table, mode).await {
            Ok(()) => {
                self.metrics.record_acquired(started.elapsed());
                debug!("{} locked table {} in {} mode", tx.id(), table, mode);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failed();
                Err(e)
            }
        }
    }

    /// Claim up to `limit` unlocked rows matching `filter` without waiting
    pub async fn select_for_update_skip_locked(
        &self,
        filter: &RowFilter,
        tx: &dyn StoreTransaction,
        limit: usize,
    ) -> WardenResult<Vec<VersionedRecord>> {
        let claimed = tx
            .select_for_update_skip_locked(&self.table, filter, limit)
            .await?;
        for record in &claimed {
            self.track(tx, &record.id);
        }
        Ok(claimed)
    }

    /// Poll with `skip_locked` until the row frees up; `Ok(None)` once
    /// `queue_timeout` passes
    pub async fn queued_lock_acquisition(
        &self,
        id: &str,
        tx: &dyn StoreTransaction,
        queue_timeout: Duration,
    ) -> WardenResult<Option<VersionedRecord>> {
        let deadline = Instant::now() + queue_timeout;
        let poll_interval = Duration::from_millis(self.config.queue_poll_interval_ms);

        loop {
            if let Some(record) = self
                .acquire_row_lock_for_update(id, tx, RowLockOptions::skip_locked())
                .await?
            {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} gave up queueing for {} after {:?}",
                    tx.id(),
                    self.resource(id),
                    queue_timeout
                );
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Probe with a `skip_locked` attempt. A free row ends up locked by `tx`.
    pub async fn is_record_locked(&self, id: &str, tx: &dyn StoreTransaction) -> WardenResult<bool> {
        let probe = self
            .acquire_row_lock_for_update(id, tx, RowLockOptions::skip_locked())
            .await?;
        Ok(probe.is_none())
    }
}
