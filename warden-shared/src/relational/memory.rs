//! In-process relational store with row and table locks, lock-wait timeouts
//! and wait-for-graph deadlock detection.
//!
//! Autocommit writes ([`RelationalStore`] methods) do not wait for row locks;
//! only [`StoreTransaction`] lock requests contend with each other.

use super::{
    LockWait, RelationalStore, RowFilter, RowLockMode, StoreTransaction, TableLockMode,
    VersionedRecord,
};
use crate::deadlock::DeadlockDetector;
use crate::exception::{WardenError, WardenResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryDatabaseConfig {
    /// Lock wait limit for table locks; row locks take theirs from the request
    pub lock_wait_timeout_ms: u64,
}

impl Default for InMemoryDatabaseConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 5_000,
        }
    }
}

impl InMemoryDatabaseConfig {
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    version: i64,
    data: Map<String, Value>,
}

#[derive(Debug, Default)]
struct RowLock {
    exclusive: Option<String>,
    shared: HashSet<String>,
}

impl RowLock {
    fn blockers(&self, tx: &str, mode: RowLockMode) -> Vec<String> {
        let mut blockers: Vec<String> = self
            .exclusive
            .iter()
            .filter(|holder| holder.as_str() != tx)
            .cloned()
            .collect();
        if mode == RowLockMode::Exclusive {
            blockers.extend(self.shared.iter().filter(|h| h.as_str() != tx).cloned());
        }
        blockers
    }

    fn grant(&mut self, tx: &str, mode: RowLockMode) {
        match mode {
            RowLockMode::Exclusive => {
                self.shared.remove(tx);
                self.exclusive = Some(tx.to_string());
            }
            RowLockMode::Shared => {
                if self.exclusive.as_deref() != Some(tx) {
                    self.shared.insert(tx.to_string());
                }
            }
        }
    }

    fn release(&mut self, tx: &str) {
        if self.exclusive.as_deref() == Some(tx) {
            self.exclusive = None;
        }
        self.shared.remove(tx);
    }

    fn holders(&self) -> Vec<String> {
        let mut holders: Vec<String> = self.exclusive.iter().cloned().collect();
        holders.extend(self.shared.iter().cloned());
        holders.sort();
        holders
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Default)]
struct DbState {
    tables: HashMap<String, BTreeMap<String, StoredRow>>,
    row_locks: HashMap<(String, String), RowLock>,
    table_locks: HashMap<String, Vec<(String, TableLockMode)>>,
}

impl DbState {
    fn record(&self, table: &str, id: &str) -> Option<VersionedRecord> {
        self.tables.get(table)?.get(id).map(|row| VersionedRecord {
            id: id.to_string(),
            version: row.version,
            data: row.data.clone(),
        })
    }

    /// Other transactions holding table locks that conflict with `mode`
    fn table_lock_blockers(&self, tx: &str, table: &str, mode: TableLockMode) -> Vec<String> {
        self.table_locks
            .get(table)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|(holder, held)| holder != tx && held.conflicts_with(mode))
                    .map(|(holder, _)| holder.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Row locks carry an implicit ROW SHARE lock on their table
    fn row_lock_blockers(&self, tx: &str, table: &str, id: &str, mode: RowLockMode) -> Vec<String> {
        let mut blockers = self.table_lock_blockers(tx, table, TableLockMode::RowShare);
        if let Some(lock) = self.row_locks.get(&(table.to_string(), id.to_string())) {
            blockers.extend(lock.blockers(tx, mode));
        }
        blockers
    }

    fn table_request_blockers(&self, tx: &str, table: &str, mode: TableLockMode) -> Vec<String> {
        let mut blockers = self.table_lock_blockers(tx, table, mode);
        if mode.conflicts_with(TableLockMode::RowShare) {
            for ((lock_table, _), lock) in &self.row_locks {
                if lock_table == table {
                    blockers.extend(lock.holders().into_iter().filter(|h| h != tx));
                }
            }
        }
        blockers.sort();
        blockers.dedup();
        blockers
    }

    fn grant_row(&mut self, tx: &str, table: &str, id: &str, mode: RowLockMode) {
        self.row_locks
            .entry((table.to_string(), id.to_string()))
            .or_default()
            .grant(tx, mode);
    }

    fn release_all(&mut self, tx: &str) {
        for lock in self.row_locks.values_mut() {
            lock.release(tx);
        }
        self.row_locks.retain(|_, lock| !lock.is_free());
        for holders in self.table_locks.values_mut() {
            holders.retain(|(holder, _)| holder != tx);
        }
        self.table_locks.retain(|_, holders| !holders.is_empty());
    }
}

enum Attempt<T> {
    Granted(T),
    Blocked(Vec<String>),
    Failed(WardenError),
}

#[derive(Debug)]
struct DbInner {
    state: Mutex<DbState>,
    changed: Notify,
    detector: DeadlockDetector,
    config: InMemoryDatabaseConfig,
    next_tx: AtomicU64,
}

impl DbInner {
    fn lock_state(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, tx: &str) {
        self.lock_state().release_all(tx);
        self.detector.remove_transaction(tx);
        self.changed.notify_waiters();
    }

    /// Run `attempt` until it grants, waiting on lock releases according to `wait`.
    /// `Ok(None)` means the lock was busy under [`LockWait::SkipLocked`].
    async fn acquire<T, F>(
        &self,
        tx: &str,
        resource: &str,
        wait: LockWait,
        mut attempt: F,
    ) -> WardenResult<Option<T>>
    where
        F: FnMut(&mut DbState) -> Attempt<T>,
    {
        let deadline = match wait {
            LockWait::Block(timeout) => Some(Instant::now() + timeout),
            LockWait::NoWait | LockWait::SkipLocked => None,
        };

        loop {
            // Registered before the state check so a release in between is not missed
            let released = self.changed.notified();

            let outcome = {
                let mut state = self.lock_state();
                attempt(&mut state)
            };
            let blockers = match outcome {
                Attempt::Granted(value) => {
                    self.detector.remove_waits_of(tx);
                    return Ok(Some(value));
                }
                Attempt::Failed(error) => {
                    self.detector.remove_waits_of(tx);
                    return Err(error);
                }
                Attempt::Blocked(blockers) => blockers,
            };

            let Some(deadline) = deadline else {
                return match wait {
                    LockWait::SkipLocked => Ok(None),
                    _ => Err(WardenError::lock_unavailable(
                        resource,
                        format!("could not obtain lock NOWAIT, held by {}", blockers.join(", ")),
                    )),
                };
            };

            self.detector.remove_waits_of(tx);
            for holder in &blockers {
                self.detector.add_wait_for(tx, holder, resource);
            }
            if let Some(cycle) = self.detector.detect_cycle_through(tx) {
                self.detector.remove_waits_of(tx);
                return Err(WardenError::database(
                    "40P01",
                    format!("deadlock detected: {}", cycle.describe()),
                ));
            }

            debug!("{} waiting for {} held by {:?}", tx, resource, blockers);
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                self.detector.remove_waits_of(tx);
                return Err(WardenError::lock_timeout(
                    resource,
                    "lock wait timeout exceeded (SQLSTATE 55P03)",
                ));
            }
        }
    }
}

/// In-memory relational store. Clones share the same tables and locks.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    inner: Arc<DbInner>,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::with_config(InMemoryDatabaseConfig::default())
    }

    pub fn with_config(config: InMemoryDatabaseConfig) -> Self {
        Self {
            inner: Arc::new(DbInner {
                state: Mutex::new(DbState::default()),
                changed: Notify::new(),
                detector: DeadlockDetector::new(),
                config,
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Insert or replace a row at version 0
    pub fn insert(&self, table: &str, id: &str, data: Map<String, Value>) -> VersionedRecord {
        let mut state = self.inner.lock_state();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredRow {
                    version: 0,
                    data: data.clone(),
                },
            );
        VersionedRecord::new(id, data)
    }

    pub fn get(&self, table: &str, id: &str) -> Option<VersionedRecord> {
        self.inner.lock_state().record(table, id)
    }

    /// Transactions currently holding a lock on the row
    pub fn row_lock_holders(&self, table: &str, id: &str) -> Vec<String> {
        self.inner
            .lock_state()
            .row_locks
            .get(&(table.to_string(), id.to_string()))
            .map(RowLock::holders)
            .unwrap_or_default()
    }

    pub fn table_lock_holders(&self, table: &str) -> Vec<(String, TableLockMode)> {
        self.inner
            .lock_state()
            .table_locks
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn detector(&self) -> &DeadlockDetector {
        &self.inner.detector
    }

    /// Typed handle, for callers that want the in-memory specifics
    pub fn begin_transaction(&self) -> InMemoryTransaction {
        let n = self.inner.next_tx.fetch_add(1, Ordering::SeqCst);
        InMemoryTransaction {
            id: format!("tx-{n}"),
            inner: Arc::clone(&self.inner),
            status: Mutex::new(TxStatus::Active),
        }
    }
}

#[async_trait]
impl RelationalStore for InMemoryDatabase {
    async fn begin(&self) -> WardenResult<Arc<dyn StoreTransaction>> {
        Ok(Arc::new(self.begin_transaction()))
    }

    async fn fetch(&self, table: &str, id: &str) -> WardenResult<Option<VersionedRecord>> {
        Ok(self.get(table, id))
    }

    async fn update_if_version(
        &self,
        table: &str,
        id: &str,
        expected_version: i64,
        patch: &Map<String, Value>,
    ) -> WardenResult<u64> {
        let mut state = self.inner.lock_state();
        let Some(row) = state.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) else {
            return Ok(0);
        };
        if row.version != expected_version {
            return Ok(0);
        }
        for (column, value) in patch {
            if column != "id" && column != "version" {
                row.data.insert(column.clone(), value.clone());
            }
        }
        row.version += 1;
        Ok(1)
    }

    async fn compare_and_swap_field(
        &self,
        table: &str,
        id: &str,
        field: &str,
        expected_value: &Value,
        new_value: &Value,
        version: i64,
    ) -> WardenResult<u64> {
        let mut state = self.inner.lock_state();
        let Some(row) = state.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) else {
            return Ok(0);
        };
        let current = row.data.get(field).unwrap_or(&Value::Null);
        if row.version != version || current != expected_value {
            return Ok(0);
        }
        row.data.insert(field.to_string(), new_value.clone());
        row.version += 1;
        Ok(1)
    }

    async fn reset_version(&self, table: &str, id: &str) -> WardenResult<u64> {
        let mut state = self.inner.lock_state();
        match state.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(row) => {
                row.version = 0;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed,
    RolledBack,
}

impl TxStatus {
    fn label(self) -> &'static str {
        match self {
            TxStatus::Active => "active",
            TxStatus::Committed => "committed",
            TxStatus::RolledBack => "rolled back",
        }
    }
}

/// Transaction on an [`InMemoryDatabase`]; dropping it while active rolls it back
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: String,
    inner: Arc<DbInner>,
    status: Mutex<TxStatus>,
}

impl InMemoryTransaction {
    fn ensure_active(&self) -> WardenResult<()> {
        let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status == TxStatus::Active {
            Ok(())
        } else {
            Err(WardenError::TransactionClosed {
                id: self.id.clone(),
                state: status.label().to_string(),
            })
        }
    }

    fn close(&self, next: TxStatus) -> WardenResult<()> {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status != TxStatus::Active {
                return Err(WardenError::TransactionClosed {
                    id: self.id.clone(),
                    state: status.label().to_string(),
                });
            }
            *status = next;
        }
        self.inner.finish(&self.id);
        debug!("Transaction {} {}", self.id, next.label());
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        let status = *self.status.get_mut().unwrap_or_else(PoisonError::into_inner);
        if status == TxStatus::Active {
            self.inner.finish(&self.id);
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn lock_row(
        &self,
        table: &str,
        id: &str,
        mode: RowLockMode,
        wait: LockWait,
    ) -> WardenResult<Option<VersionedRecord>> {
        self.ensure_active()?;
        let resource = format!("{table}:{id}");
        self.inner
            .acquire(&self.id, &resource, wait, |state| {
                let Some(record) = state.record(table, id) else {
                    return Attempt::Failed(WardenError::RecordNotFound {
                        entity: table.to_string(),
                        id: id.to_string(),
                    });
                };
                let blockers = state.row_lock_blockers(&self.id, table, id, mode);
                if blockers.is_empty() {
                    state.grant_row(&self.id, table, id, mode);
                    Attempt::Granted(record)
                } else {
                    Attempt::Blocked(blockers)
                }
            })
            .await
    }

    async fn lock_table(&self, table: &str, mode: TableLockMode) -> WardenResult<()> {
        self.ensure_active()?;
        let resource = format!("table {table}");
        let wait = LockWait::Block(self.inner.config.lock_wait_timeout());
        self.inner
            .acquire(&self.id, &resource, wait, |state| {
                let blockers = state.table_request_blockers(&self.id, table, mode);
                if blockers.is_empty() {
                    state
                        .table_locks
                        .entry(table.to_string())
                        .or_default()
                        .push((self.id.clone(), mode));
                    Attempt::Granted(())
                } else {
                    Attempt::Blocked(blockers)
                }
            })
            .await
            .map(|_| ())
    }

    async fn select_for_update_skip_locked(
        &self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> WardenResult<Vec<VersionedRecord>> {
        self.ensure_active()?;
        let mut state = self.inner.lock_state();
        if !state
            .table_lock_blockers(&self.id, table, TableLockMode::RowShare)
            .is_empty()
        {
            return Ok(Vec::new());
        }

        let candidates: Vec<VersionedRecord> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, row)| VersionedRecord {
                        id: id.clone(),
                        version: row.version,
                        data: row.data.clone(),
                    })
                    .filter(|record| filter.matches(record))
                    .collect()
            })
            .unwrap_or_default();

        let mut claimed = Vec::new();
        for record in candidates {
            if claimed.len() >= limit {
                break;
            }
            let key = (table.to_string(), record.id.clone());
            let free = state
                .row_locks
                .get(&key)
                .map_or(true, |lock| lock.blockers(&self.id, RowLockMode::Exclusive).is_empty());
            if free {
                state.grant_row(&self.id, table, &record.id, RowLockMode::Exclusive);
                claimed.push(record);
            }
        }
        Ok(claimed)
    }

    async fn commit(&self) -> WardenResult<()> {
        self.close(TxStatus::Committed)
    }

    async fn rollback(&self) -> WardenResult<()> {
        self.close(TxStatus::RolledBack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> InMemoryDatabase {
        let db = InMemoryDatabase::new();
        for id in ["a", "b", "c"] {
            let mut data = Map::new();
            data.insert("status".to_string(), json!("pending"));
            db.insert("jobs", id, data);
        }
        db
    }

    #[tokio::test]
    async fn test_exclusive_row_lock_blocks_other_transaction() {
        let db = seeded();
        let tx1 = db.begin_transaction();
        let tx2 = db.begin_transaction();

        let row = tx1
            .lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();
        assert_eq!(row.map(|r| r.id), Some("a".to_string()));

        let skipped = tx2
            .lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::SkipLocked)
            .await
            .unwrap();
        assert!(skipped.is_none());

        let err = tx2
            .lock_row("jobs", "a", RowLockMode::Shared, LockWait::NoWait)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::PessimisticLock { timeout: false, .. }
        ));

        tx1.commit().await.unwrap();
        assert!(tx2
            .lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let db = seeded();
        let tx1 = db.begin_transaction();
        let tx2 = db.begin_transaction();

        for tx in [&tx1, &tx2] {
            assert!(tx
                .lock_row("jobs", "b", RowLockMode::Shared, LockWait::NoWait)
                .await
                .unwrap()
                .is_some());
        }
        assert_eq!(db.row_lock_holders("jobs", "b").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_lock_times_out() {
        let db = seeded();
        let tx1 = db.begin_transaction();
        let tx2 = db.begin_transaction();
        tx1.lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();

        let err = tx2
            .lock_row(
                "jobs",
                "a",
                RowLockMode::Exclusive,
                LockWait::Block(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(db.detector().edge_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let db = seeded();
        let tx1 = db.begin_transaction();
        let tx2 = db.begin_transaction();
        tx1.lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();

        let waiter = tokio::spawn(async move {
            tx2.lock_row(
                "jobs",
                "a",
                RowLockMode::Exclusive,
                LockWait::Block(Duration::from_secs(5)),
            )
            .await
            .map(|row| row.is_some())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx1.rollback().await.unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_opposite_order_locking_detects_deadlock() {
        let db = seeded();
        let tx1 = Arc::new(db.begin_transaction());
        let tx2 = db.begin_transaction();
        tx1.lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();
        tx2.lock_row("jobs", "b", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();

        let tx1_waiter = Arc::clone(&tx1);
        let first = tokio::spawn(async move {
            tx1_waiter
                .lock_row(
                    "jobs",
                    "b",
                    RowLockMode::Exclusive,
                    LockWait::Block(Duration::from_secs(5)),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = tx2
            .lock_row(
                "jobs",
                "a",
                RowLockMode::Exclusive,
                LockWait::Block(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some("40P01"));

        tx2.rollback().await.unwrap();
        assert!(first.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let db = seeded();
        let tx = db.begin_transaction();
        let err = tx
            .lock_row("jobs", "zzz", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::RecordNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_lock_conflicts_with_row_locks() {
        let db = InMemoryDatabase::with_config(InMemoryDatabaseConfig {
            lock_wait_timeout_ms: 100,
        });
        db.insert("jobs", "a", Map::new());
        let tx1 = db.begin_transaction();
        let tx2 = db.begin_transaction();

        tx1.lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();
        tx2.lock_table("jobs", TableLockMode::Share).await.unwrap();
        let err = tx2
            .lock_table("jobs", TableLockMode::Exclusive)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_skip_locked_batch_claims_free_rows() {
        let db = seeded();
        let tx1 = db.begin_transaction();
        let tx2 = db.begin_transaction();
        tx1.lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .unwrap();

        let filter = RowFilter::all().where_eq("status", "pending");
        let claimed = tx2
            .select_for_update_skip_locked("jobs", &filter, 5)
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let limited = db
            .begin_transaction()
            .select_for_update_skip_locked("jobs", &filter, 1)
            .await
            .unwrap();
        assert!(limited.is_empty());
    }

    #[tokio::test]
    async fn test_closed_transaction_rejects_work() {
        let db = seeded();
        let tx = db.begin_transaction();
        tx.commit().await.unwrap();

        assert!(matches!(
            tx.commit().await,
            Err(WardenError::TransactionClosed { .. })
        ));
        assert!(tx
            .lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_drop_releases_locks() {
        let db = seeded();
        {
            let tx = db.begin_transaction();
            tx.lock_row("jobs", "a", RowLockMode::Exclusive, LockWait::NoWait)
                .await
                .unwrap();
            assert_eq!(db.row_lock_holders("jobs", "a").len(), 1);
        }
        assert!(db.row_lock_holders("jobs", "a").is_empty());
    }

    #[tokio::test]
    async fn test_versioned_writes() {
        let db = seeded();
        let mut patch = Map::new();
        patch.insert("status".to_string(), json!("done"));

        assert_eq!(db.update_if_version("jobs", "a", 0, &patch).await.unwrap(), 1);
        assert_eq!(db.update_if_version("jobs", "a", 0, &patch).await.unwrap(), 0);
        assert_eq!(db.get("jobs", "a").unwrap().version, 1);

        let swapped = db
            .compare_and_swap_field("jobs", "a", "status", &json!("done"), &json!("archived"), 1)
            .await
            .unwrap();
        assert_eq!(swapped, 1);
        let stale = db
            .compare_and_swap_field("jobs", "a", "status", &json!("done"), &json!("x"), 2)
            .await
            .unwrap();
        assert_eq!(stale, 0);

        assert_eq!(db.reset_version("jobs", "a").await.unwrap(), 1);
        assert_eq!(db.get("jobs", "a").unwrap().version, 0);
    }
}
