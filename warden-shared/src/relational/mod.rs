//! Relational store boundary
//!
//! [`RelationalStore`] covers the autocommit, version-checked writes used by
//! optimistic locking. [`StoreTransaction`] covers the lock clauses used by
//! pessimistic locking; every lock it takes lives until commit or rollback.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sql;

use crate::exception::WardenResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{InMemoryDatabase, InMemoryDatabaseConfig, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use postgres::{PgRelationalStore, PgTransaction};
pub use sql::{quote_ident, LockClause};

/// A row participating in optimistic locking: identifier, integer version and the other columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub id: String,
    pub version: i64,
    pub data: Map<String, Value>,
}

impl VersionedRecord {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            data,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match name {
            "id" | "version" => None,
            _ => self.data.get(name),
        }
    }

    /// The record after a successful versioned write of `patch`
    pub fn patched(mut self, patch: &Map<String, Value>) -> Self {
        for (column, value) in patch {
            if column != "id" && column != "version" {
                self.data.insert(column.clone(), value.clone());
            }
        }
        self.version += 1;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowLockMode {
    /// `FOR UPDATE`
    Exclusive,
    /// `FOR SHARE`
    Shared,
}

/// What a row lock request does when the row is already locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Wait up to the given lock-wait timeout
    Block(Duration),
    /// Fail immediately
    NoWait,
    /// Return nothing instead of waiting
    SkipLocked,
}

/// PostgreSQL table lock modes, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableLockMode {
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
}

impl TableLockMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            TableLockMode::AccessShare => "ACCESS SHARE",
            TableLockMode::RowShare => "ROW SHARE",
            TableLockMode::RowExclusive => "ROW EXCLUSIVE",
            TableLockMode::ShareUpdateExclusive => "SHARE UPDATE EXCLUSIVE",
            TableLockMode::Share => "SHARE",
            TableLockMode::ShareRowExclusive => "SHARE ROW EXCLUSIVE",
            TableLockMode::Exclusive => "EXCLUSIVE",
            TableLockMode::AccessExclusive => "ACCESS EXCLUSIVE",
        }
    }

    /// Table-level lock conflict matrix
    pub fn conflicts_with(&self, other: TableLockMode) -> bool {
        use TableLockMode::*;
        match self {
            AccessShare => matches!(other, AccessExclusive),
            RowShare => matches!(other, Exclusive | AccessExclusive),
            RowExclusive => matches!(
                other,
                Share | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            ShareUpdateExclusive => matches!(
                other,
                ShareUpdateExclusive | Share | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            Share => matches!(
                other,
                RowExclusive | ShareUpdateExclusive | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            ShareRowExclusive => !matches!(other, AccessShare | RowShare),
            Exclusive => !matches!(other, AccessShare),
            AccessExclusive => true,
        }
    }
}

impl fmt::Display for TableLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Conjunction of column equality conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub conditions: Vec<(String, Value)>,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn matches(&self, record: &VersionedRecord) -> bool {
        self.conditions
            .iter()
            .all(|(column, expected)| match column.as_str() {
                "id" => expected.as_str() == Some(record.id.as_str()),
                "version" => expected.as_i64() == Some(record.version),
                _ => record.data.get(column) == Some(expected),
            })
    }
}

/// Transaction handle exposing row and table lock clauses
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    fn id(&self) -> &str;

    /// Lock one row. `Ok(None)` only under [`LockWait::SkipLocked`] when the row is
    /// locked by someone else; a missing row is `WardenError::RecordNotFound`.
    async fn lock_row(
        &self,
        table: &str,
        id: &str,
        mode: RowLockMode,
        wait: LockWait,
    ) -> WardenResult<Option<VersionedRecord>>;

    async fn lock_table(&self, table: &str, mode: TableLockMode) -> WardenResult<()>;

    /// `SELECT ... WHERE filter LIMIT limit FOR UPDATE SKIP LOCKED`
    async fn select_for_update_skip_locked(
        &self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> WardenResult<Vec<VersionedRecord>>;

    async fn commit(&self) -> WardenResult<()>;

    async fn rollback(&self) -> WardenResult<()>;
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn begin(&self) -> WardenResult<Arc<dyn StoreTransaction>>;

    async fn fetch(&self, table: &str, id: &str) -> WardenResult<Option<VersionedRecord>>;

    /// `UPDATE table SET patch.., version = version + 1 WHERE id = ? AND version = ?`;
    /// returns the affected-row count
    async fn update_if_version(
        &self,
        table: &str,
        id: &str,
        expected_version: i64,
        patch: &Map<String, Value>,
    ) -> WardenResult<u64>;

    /// Set `field` to `new_value` and bump the version, only when both the field
    /// and the version still hold their expected values
    async fn compare_and_swap_field(
        &self,
        table: &str,
        id: &str,
        field: &str,
        expected_value: &Value,
        new_value: &Value,
        version: i64,
    ) -> WardenResult<u64>;

    async fn reset_version(&self, table: &str, id: &str) -> WardenResult<u64>;
}
