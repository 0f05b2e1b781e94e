//! Database module: the read-only capabilities the pipeline needs from an engine
//!
//! Three kinds of traffic only: metadata introspection, a non-mutating
//! plan/explain dry-run, and the final bounded SELECT.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

use crate::catalog::Table;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    /// Parser dialect used by the validator
    pub fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
        }
    }

    /// Name shown to the model
    pub fn display_name(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "SQLite",
            SqlDialect::Postgres => "PostgreSQL",
        }
    }
}

/// Outcome of a plan/explain dry-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRun {
    Accepted,
    /// The engine refused to plan the statement; carries its message
    Rejected(String),
}

/// Backstop limits applied by the engine when executing a statement.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_rows: usize,
    pub timeout: Duration,
}

/// Tabular result of an executed statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// More rows existed than `max_rows`
    pub truncated: bool,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as `column -> value` objects
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<serde_json::Map<_, _>>()
            })
            .collect()
    }

    /// Value of a named column in a given row
    pub fn value(&self, row: usize, column: &str) -> Option<&serde_json::Value> {
        let idx = self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// Handle to the target database.
#[async_trait]
pub trait Database: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Read tables, columns, keys, row hints and up to `sample_values`
    /// distinct non-null values per column, in declaration order.
    async fn introspect(&self, sample_values: usize) -> Result<Vec<Table>>;

    /// Ask the engine to plan `sql` without running it. `Err` means the
    /// dry-run itself could not be performed.
    async fn dry_run(&self, sql: &str) -> Result<DryRun>;

    /// Run a read-only statement under `limits`.
    async fn query(&self, sql: &str, limits: &QueryLimits) -> Result<ResultSet>;
}

/// Double-quote an identifier for interpolation into metadata queries
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_set_records() {
        let rs = ResultSet {
            columns: vec!["name".to_string(), "price".to_string()],
            rows: vec![vec![json!("Laptop"), json!(999.5)]],
            truncated: false,
        };
        let records = rs.to_records();
        assert_eq!(records[0]["name"], json!("Laptop"));
        assert_eq!(rs.value(0, "PRICE"), Some(&json!(999.5)));
        assert_eq!(rs.value(1, "price"), None);
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
