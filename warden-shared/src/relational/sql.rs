//! SQL text for lock clauses, shared by SQL-backed store adapters

use super::{LockWait, RowFilter, RowLockMode, TableLockMode};
use serde_json::Value;
use std::time::Duration;

/// Quote an identifier, keeping schema qualification (`audit.events` -> `"audit"."events"`)
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Row lock clause appended to a `SELECT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockClause {
    pub mode: RowLockMode,
    pub wait: LockWait,
}

impl LockClause {
    pub fn new(mode: RowLockMode, wait: LockWait) -> Self {
        Self { mode, wait }
    }

    pub fn to_sql(&self) -> String {
        let base = match self.mode {
            RowLockMode::Exclusive => "FOR UPDATE",
            RowLockMode::Shared => "FOR SHARE",
        };
        match self.wait {
            LockWait::Block(_) => base.to_string(),
            LockWait::NoWait => format!("{base} NOWAIT"),
            LockWait::SkipLocked => format!("{base} SKIP LOCKED"),
        }
    }
}

pub fn lock_table_statement(table: &str, mode: TableLockMode) -> String {
    format!("LOCK TABLE {} IN {} MODE", quote_ident(table), mode.as_sql())
}

/// Transaction-scoped lock wait limit; whole milliseconds, at least 1
pub fn lock_timeout_statement(timeout: Duration) -> String {
    let millis = timeout.as_millis().max(1);
    format!("SET LOCAL lock_timeout = '{millis}ms'")
}

/// A bind parameter produced by [`filter_to_sql`]
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Json(Value),
}

/// Render a filter against table alias `alias`, numbering placeholders from `first_param`
pub fn filter_to_sql(filter: &RowFilter, alias: &str, first_param: usize) -> (String, Vec<SqlParam>) {
    if filter.conditions.is_empty() {
        return ("TRUE".to_string(), Vec::new());
    }

    let mut clauses = Vec::with_capacity(filter.conditions.len());
    let mut params = Vec::with_capacity(filter.conditions.len());
    for (offset, (column, value)) in filter.conditions.iter().enumerate() {
        let placeholder = first_param + offset;
        if column == "id" {
            clauses.push(format!("{alias}.\"id\"::text = ${placeholder}"));
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push(SqlParam::Text(text));
        } else {
            clauses.push(format!(
                "to_jsonb({alias}.{}) = ${placeholder}::jsonb",
                quote_ident(column)
            ));
            params.push(SqlParam::Json(value.clone()));
        }
    }
    (clauses.join(" AND "), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("students"), "\"students\"");
        assert_eq!(quote_ident("audit.events"), "\"audit\".\"events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_lock_clause_rendering() {
        let timeout = Duration::from_secs(5);
        assert_eq!(
            LockClause::new(RowLockMode::Exclusive, LockWait::Block(timeout)).to_sql(),
            "FOR UPDATE"
        );
        assert_eq!(
            LockClause::new(RowLockMode::Exclusive, LockWait::SkipLocked).to_sql(),
            "FOR UPDATE SKIP LOCKED"
        );
        assert_eq!(
            LockClause::new(RowLockMode::Shared, LockWait::NoWait).to_sql(),
            "FOR SHARE NOWAIT"
        );
    }

    #[test]
    fn test_table_lock_and_timeout_statements() {
        assert_eq!(
            lock_table_statement("medications", TableLockMode::ShareRowExclusive),
            "LOCK TABLE \"medications\" IN SHARE ROW EXCLUSIVE MODE"
        );
        assert_eq!(
            lock_timeout_statement(Duration::from_millis(1500)),
            "SET LOCAL lock_timeout = '1500ms'"
        );
        assert_eq!(
            lock_timeout_statement(Duration::ZERO),
            "SET LOCAL lock_timeout = '1ms'"
        );
    }

    #[test]
    fn test_filter_to_sql() {
        let filter = RowFilter::all()
            .where_eq("status", "pending")
            .where_eq("id", 12);
        let (sql, params) = filter_to_sql(&filter, "t", 2);
        assert_eq!(
            sql,
            "to_jsonb(t.\"status\") = $2::jsonb AND t.\"id\"::text = $3"
        );
        assert_eq!(
            params,
            vec![
                SqlParam::Json(json!("pending")),
                SqlParam::Text("12".to_string())
            ]
        );

        let (sql, params) = filter_to_sql(&RowFilter::all(), "t", 1);
        assert_eq!(sql, "TRUE");
        assert!(params.is_empty());
    }
}
