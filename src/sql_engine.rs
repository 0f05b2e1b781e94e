//! SQL Engine - executor for validated candidates
//!
//! Runs the final statement with a row cap and a time limit. Engine
//! failures here are terminal for the question.

use crate::db::{Database, QueryLimits, ResultSet};
use crate::error::{Result, Text2SqlError};
use crate::generator::Candidate;
use crate::validation::ValidationResult;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct SqlEngine {
    db: Arc<dyn Database>,
    limits: QueryLimits,
}

impl SqlEngine {
    pub fn new(db: Arc<dyn Database>, max_rows: usize, timeout: Duration) -> Self {
        Self {
            db,
            limits: QueryLimits { max_rows, timeout },
        }
    }

    /// Execute a candidate whose validation verdict is `Valid`.
    pub async fn execute(&self, candidate: &Candidate, validation: &ValidationResult) -> Result<ResultSet> {
        if !validation.is_valid() {
            return Err(Text2SqlError::Execution(format!(
                "Refusing to execute a candidate that failed validation ({})",
                validation
            )));
        }

        let start_time = Instant::now();
        info!("Executing: {}", candidate.sql);

        let result = tokio::time::timeout(
            self.limits.timeout,
            self.db.query(&candidate.sql, &self.limits),
        )
        .await
        .map_err(|_| Text2SqlError::Execution(format!("Query timed out after {:?}", self.limits.timeout)))?
        .map_err(|e| match e {
            Text2SqlError::Execution(_) => e,
            other => Text2SqlError::Execution(other.to_string()),
        })?;

        let elapsed = start_time.elapsed().as_millis();
        if result.truncated {
            warn!(
                "Result truncated to {} rows ({}ms)",
                self.limits.max_rows, elapsed
            );
        } else {
            info!("Query returned {} rows in {}ms", result.row_count(), elapsed);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use rusqlite::Connection;

    fn engine(max_rows: usize) -> SqlEngine {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE products (product_id INTEGER PRIMARY KEY, name TEXT, price REAL);
             INSERT INTO products (name, price) VALUES ('Pen', 1.5), ('Desk', 250.0), ('Lamp', 40.0);",
        )
        .unwrap();
        SqlEngine::new(Arc::new(SqliteDatabase::from_connection(conn)), max_rows, Duration::from_secs(5))
    }

    fn candidate(sql: &str) -> Candidate {
        Candidate {
            sql: sql.to_string(),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn test_execute_valid_candidate() {
        let rs = engine(10)
            .execute(
                &candidate("SELECT name FROM products ORDER BY price DESC"),
                &ValidationResult::Valid,
            )
            .await
            .unwrap();
        assert_eq!(rs.row_count(), 3);
        assert_eq!(rs.rows[0][0], serde_json::json!("Desk"));
        assert!(!rs.truncated);
    }

    #[tokio::test]
    async fn test_row_cap_applies() {
        let rs = engine(2)
            .execute(&candidate("SELECT * FROM products"), &ValidationResult::Valid)
            .await
            .unwrap();
        assert_eq!(rs.row_count(), 2);
        assert!(rs.truncated);
    }

    #[tokio::test]
    async fn test_unvalidated_candidate_refused() {
        let err = engine(10)
            .execute(
                &candidate("DELETE FROM products"),
                &ValidationResult::SafetyViolation {
                    statement_type: "DELETE".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Text2SqlError::Execution(_)));
    }

    #[tokio::test]
    async fn test_engine_error_is_execution_error() {
        let err = engine(10)
            .execute(&candidate("SELECT abs(1, 2) FROM products"), &ValidationResult::Valid)
            .await
            .unwrap_err();
        assert!(matches!(err, Text2SqlError::Execution(_)));
    }
}
