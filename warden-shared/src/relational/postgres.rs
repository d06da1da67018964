//! PostgreSQL-backed [`RelationalStore`]
//!
//! Tables need an `id` column (compared as text) and an integer `version` column.
//! Rows travel as `to_jsonb(t)` so any other column layout works.

use super::sql::{filter_to_sql, lock_table_statement, lock_timeout_statement, quote_ident, SqlParam};
use super::{
    LockClause, LockWait, RelationalStore, RowFilter, RowLockMode, StoreTransaction,
    TableLockMode, VersionedRecord,
};
use crate::error_handling::ErrorConverter;
use crate::exception::{WardenError, WardenResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Clone)]
pub struct PgRelationalStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgRelationalStore {
    /// `lock_timeout` bounds `LOCK TABLE` waits
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub async fn connect(url: &str, max_connections: u32, lock_timeout: Duration) -> WardenResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .store_context("Failed to connect to postgres")?;
        info!("Connected to postgres with {} max connections", max_connections);
        Ok(Self::new(pool, lock_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Split a `to_jsonb(row)` object into id, version and the remaining columns
pub(crate) fn record_from_json(value: Value) -> WardenResult<VersionedRecord> {
    let Value::Object(mut data) = value else {
        return Err(WardenError::store("row is not a JSON object"));
    };
    let id = match data.remove("id") {
        Some(Value::String(id)) => id,
        Some(Value::Null) | None => return Err(WardenError::store("row has no id column")),
        Some(other) => other.to_string(),
    };
    let version = data
        .remove("version")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| WardenError::store(format!("row {id} has no integer version column")))?;
    Ok(VersionedRecord { id, version, data })
}

fn decode_row(row: PgRow) -> WardenResult<VersionedRecord> {
    let value: Value = row.try_get("row").store_context("Failed to decode row")?;
    record_from_json(value)
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Keep the SQLSTATE of database errors so retry classification never parses messages
fn map_sqlx_error(err: sqlx::Error, context: &str) -> WardenError {
    match sqlstate(&err) {
        Some(code) => WardenError::database(code, format!("{context}: {err}")),
        None => WardenError::store(format!("{context}: {err}")),
    }
}

/// Translate lock-related SQLSTATEs; everything else keeps its code
fn map_lock_error(err: sqlx::Error, resource: &str, wait: LockWait) -> WardenError {
    match sqlstate(&err).as_deref() {
        Some(LOCK_NOT_AVAILABLE) => match wait {
            LockWait::NoWait => WardenError::lock_unavailable(resource, err.to_string()),
            _ => WardenError::lock_timeout(resource, err.to_string()),
        },
        _ => map_sqlx_error(err, resource),
    }
}

/// Columns a patch may write; `id` and `version` are managed here
fn patch_columns(patch: &Map<String, Value>) -> Vec<String> {
    patch
        .keys()
        .filter(|column| column.as_str() != "id" && column.as_str() != "version")
        .cloned()
        .collect()
}

#[async_trait]
impl RelationalStore for PgRelationalStore {
    async fn begin(&self) -> WardenResult<Arc<dyn StoreTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .store_context("Failed to begin transaction")?;
        let id = uuid::Uuid::new_v4().to_string();
        debug!("Began postgres transaction {}", id);
        Ok(Arc::new(PgTransaction {
            id,
            default_lock_timeout: self.lock_timeout,
            tx: Mutex::new(Some(tx)),
        }))
    }

    async fn fetch(&self, table: &str, id: &str) -> WardenResult<Option<VersionedRecord>> {
        let sql = format!(
            "SELECT to_jsonb(t) AS row FROM {} t WHERE t.\"id\"::text = $1",
            quote_ident(table)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .store_context_with(|| format!("Failed to fetch {table} {id}"))?;
        row.map(decode_row).transpose()
    }

    async fn update_if_version(
        &self,
        table: &str,
        id: &str,
        expected_version: i64,
        patch: &Map<String, Value>,
    ) -> WardenResult<u64> {
        let table_sql = quote_ident(table);
        let columns = patch_columns(patch);
        let sql = if columns.is_empty() {
            format!(
                "UPDATE {table_sql} AS t SET \"version\" = t.\"version\" + 1 \
                 WHERE t.\"id\"::text = $1 AND t.\"version\" = $2"
            )
        } else {
            let assignments: Vec<String> = columns
                .iter()
                .map(|column| {
                    let column = quote_ident(column);
                    format!("{column} = p.{column}")
                })
                .collect();
            format!(
                "UPDATE {table_sql} AS t SET {}, \"version\" = t.\"version\" + 1 \
                 FROM jsonb_populate_record(NULL::{table_sql}, $3) AS p \
                 WHERE t.\"id\"::text = $1 AND t.\"version\" = $2",
                assignments.join(", ")
            )
        };

        let mut query = sqlx::query(&sql).bind(id).bind(expected_version);
        if !columns.is_empty() {
            query = query.bind(Value::Object(patch.clone()));
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, &format!("Versioned update of {table} {id}")))?;
        Ok(result.rows_affected())
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
        let table_sql = quote_ident(table);
        let column = quote_ident(field);
        let sql = format!(
            "UPDATE {table_sql} AS t SET {column} = p.{column}, \"version\" = t.\"version\" + 1 \
             FROM jsonb_populate_record(NULL::{table_sql}, $4) AS p \
             WHERE t.\"id\"::text = $1 AND t.\"version\" = $2 AND to_jsonb(t.{column}) = $3::jsonb"
        );
        let mut replacement = Map::new();
        replacement.insert(field.to_string(), new_value.clone());

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(version)
            .bind(expected_value.clone())
            .bind(Value::Object(replacement))
            .execute(&self.pool)
            .await
            .store_context_with(|| format!("Compare-and-swap of {table}.{field} on {id}"))?;
        Ok(result.rows_affected())
    }

    async fn reset_version(&self, table: &str, id: &str) -> WardenResult<u64> {
        let sql = format!(
            "UPDATE {} SET \"version\" = 0 WHERE \"id\"::text = $1",
            quote_ident(table)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .store_context_with(|| format!("Version reset of {table} {id}"))?;
        Ok(result.rows_affected())
    }
}

/// An open postgres transaction; locks live until commit or rollback
pub struct PgTransaction {
    id: String,
    default_lock_timeout: Duration,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PgTransaction {
    fn closed(&self) -> WardenError {
        WardenError::TransactionClosed {
            id: self.id.clone(),
            state: "finished".to_string(),
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
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
        let resource = format!("{table}:{id}");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed())?;

        if let LockWait::Block(timeout) = wait {
            sqlx::query(&lock_timeout_statement(timeout))
                .execute(&mut **tx)
                .await
                .store_context("Failed to set lock_timeout")?;
        }

        let table_sql = quote_ident(table);
        let sql = format!(
            "SELECT to_jsonb(t) AS row FROM {table_sql} t WHERE t.\"id\"::text = $1 {}",
            LockClause::new(mode, wait).to_sql()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_lock_error(e, &resource, wait))?;

        if let Some(row) = row {
            return decode_row(row).map(Some);
        }

        let not_found = WardenError::RecordNotFound {
            entity: table.to_string(),
            id: id.to_string(),
        };
        if wait != LockWait::SkipLocked {
            return Err(not_found);
        }

        // SKIP LOCKED returns nothing for both locked and missing rows
        let exists_sql = format!("SELECT 1 FROM {table_sql} t WHERE t.\"id\"::text = $1");
        let exists = sqlx::query(&exists_sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .store_context_with(|| format!("Existence check of {resource}"))?;
        match exists {
            Some(_) => Ok(None),
            None => Err(not_found),
        }
    }

    async fn lock_table(&self, table: &str, mode: TableLockMode) -> WardenResult<()> {
        let resource = format!("table {table}");
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed())?;

        sqlx::query(&lock_timeout_statement(self.default_lock_timeout))
            .execute(&mut **tx)
            .await
            .store_context("Failed to set lock_timeout")?;
        sqlx::query(&lock_table_statement(table, mode))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_lock_error(e, &resource, LockWait::Block(self.default_lock_timeout)))?;
        debug!("Transaction {} locked {} in {} mode", self.id, table, mode);
        Ok(())
    }

    async fn select_for_update_skip_locked(
        &self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> WardenResult<Vec<VersionedRecord>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed())?;

        let (condition, params) = filter_to_sql(filter, "t", 1);
        let sql = format!(
            "SELECT to_jsonb(t) AS row FROM {} t WHERE {condition} ORDER BY t.\"id\" LIMIT {limit} {}",
            quote_ident(table),
            LockClause::new(RowLockMode::Exclusive, LockWait::SkipLocked).to_sql()
        );

        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                SqlParam::Text(text) => query.bind(text),
                SqlParam::Json(value) => query.bind(value),
            };
        }
        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_lock_error(e, table, LockWait::SkipLocked))?;
        rows.into_iter().map(decode_row).collect()
    }

    async fn commit(&self) -> WardenResult<()> {
        let tx = self.tx.lock().await.take().ok_or_else(|| self.closed())?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, &format!("Failed to commit transaction {}", self.id)))
    }

    async fn rollback(&self) -> WardenResult<()> {
        let tx = self.tx.lock().await.take().ok_or_else(|| self.closed())?;
        tx.rollback()
            .await
            .store_context_with(|| format!("Failed to roll back transaction {}", self.id))
    }
}
