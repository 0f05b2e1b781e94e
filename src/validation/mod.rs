//! Candidate validation
//!
//! Three ordered checks, cheapest first, stopping at the first failure:
//! syntax (one parseable statement), safety (pure read), semantic (every
//! table and column resolves against the full catalog, then an engine
//! dry-run when a database is attached).

pub mod resolver;
pub mod safety;

use crate::catalog::Catalog;
use crate::db::{Database, DryRun};
use crate::execution_loop::error_classifier::ErrorClassifier;
use crate::generator::Candidate;
use resolver::NameResolver;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid,
    SyntaxError { message: String },
    SafetyViolation { statement_type: String },
    SemanticError { unresolved_references: BTreeSet<String> },
}

/// Which check rejected a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Safety,
    Semantic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Syntax => write!(f, "syntax error"),
            FailureKind::Safety => write!(f, "safety violation"),
            FailureKind::Semantic => write!(f, "semantic error"),
        }
    }
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ValidationResult::Valid => None,
            ValidationResult::SyntaxError { .. } => Some(FailureKind::Syntax),
            ValidationResult::SafetyViolation { .. } => Some(FailureKind::Safety),
            ValidationResult::SemanticError { .. } => Some(FailureKind::Semantic),
        }
    }

    /// Human-readable reason, empty for `Valid`
    pub fn detail(&self) -> String {
        match self {
            ValidationResult::Valid => String::new(),
            ValidationResult::SyntaxError { message } => message.clone(),
            ValidationResult::SafetyViolation { statement_type } => {
                format!("{} statements are not allowed; only read-only SELECT queries may run", statement_type)
            }
            ValidationResult::SemanticError { unresolved_references } => format!(
                "unresolved references: {}",
                unresolved_references.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure_kind() {
            None => write!(f, "valid"),
            Some(kind) => write!(f, "{}: {}", kind, self.detail()),
        }
    }
}

pub struct Validator {
    catalog: Arc<Catalog>,
    db: Option<Arc<dyn Database>>,
    classifier: ErrorClassifier,
}

impl Validator {
    /// Without a database only static resolution backs the semantic check.
    pub fn new(catalog: Arc<Catalog>, db: Option<Arc<dyn Database>>) -> Self {
        Self {
            catalog,
            db,
            classifier: ErrorClassifier::new(),
        }
    }

    pub async fn validate(&self, candidate: &Candidate) -> ValidationResult {
        let result = self.validate_sql(&candidate.sql).await;
        debug!("Attempt {} validation: {}", candidate.attempt_number, result);
        result
    }

    async fn validate_sql(&self, sql: &str) -> ValidationResult {
        let statement = match self.check_syntax(sql) {
            Ok(statement) => statement,
            Err(failure) => return failure,
        };

        if let Some(statement_type) = safety::write_statement_type(&statement) {
            return ValidationResult::SafetyViolation { statement_type };
        }

        let Statement::Query(ref query) = statement else {
            return ValidationResult::SafetyViolation {
                statement_type: "UNKNOWN".to_string(),
            };
        };

        let unresolved = NameResolver::new(&self.catalog).resolve(query);
        if !unresolved.is_empty() {
            return ValidationResult::SemanticError {
                unresolved_references: unresolved,
            };
        }

        let Some(ref db) = self.db else {
            return ValidationResult::Valid;
        };
        match db.dry_run(sql).await {
            Ok(DryRun::Accepted) => ValidationResult::Valid,
            Ok(DryRun::Rejected(message)) => {
                let class = self.classifier.classify(&message);
                debug!("Dry-run rejected candidate: {}", class);
                ValidationResult::SemanticError {
                    unresolved_references: BTreeSet::from([class.reference().to_string()]),
                }
            }
            Err(e) => {
                warn!("Dry-run unavailable, keeping static verdict: {}", e);
                ValidationResult::Valid
            }
        }
    }

    /// Exactly one parseable statement in the catalog's dialect
    pub fn check_syntax(&self, sql: &str) -> Result<Statement, ValidationResult> {
        if sql.trim().is_empty() {
            return Err(ValidationResult::SyntaxError {
                message: "empty statement: no SQL could be extracted from the response".to_string(),
            });
        }
        let dialect = self.catalog.dialect().parser_dialect();
        let mut statements = Parser::parse_sql(&*dialect, sql).map_err(|e| ValidationResult::SyntaxError {
            message: e.to_string(),
        })?;
        match statements.len() {
            1 => Ok(statements.remove(0)),
            0 => Err(ValidationResult::SyntaxError {
                message: "no statement found".to_string(),
            }),
            n => Err(ValidationResult::SyntaxError {
                message: format!("expected exactly one statement, found {}", n),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, Table};
    use crate::db::{QueryLimits, ResultSet, SqlDialect};
    use crate::error::{Result, Text2SqlError};
    use async_trait::async_trait;

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::from_tables(
                vec![Table::new(
                    "customers",
                    vec![
                        Column::new("customer_id", "INTEGER").primary_key(),
                        Column::new("first_name", "TEXT"),
                    ],
                )],
                SqlDialect::Sqlite,
            )
            .unwrap(),
        )
    }

    fn candidate(sql: &str) -> Candidate {
        Candidate {
            sql: sql.to_string(),
            attempt_number: 1,
        }
    }

    /// Dry-run stub with a fixed answer
    struct FixedDryRun(Option<String>, bool);

    #[async_trait]
    impl Database for FixedDryRun {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::Sqlite
        }
        async fn introspect(&self, _: usize) -> Result<Vec<Table>> {
            Ok(Vec::new())
        }
        async fn dry_run(&self, _: &str) -> Result<DryRun> {
            if self.1 {
                return Err(Text2SqlError::Database("connection reset".to_string()));
            }
            Ok(match &self.0 {
                Some(msg) => DryRun::Rejected(msg.clone()),
                None => DryRun::Accepted,
            })
        }
        async fn query(&self, _: &str, _: &QueryLimits) -> Result<ResultSet> {
            Ok(ResultSet::default())
        }
    }

    #[tokio::test]
    async fn test_syntax_failures() {
        let validator = Validator::new(catalog(), None);
        for sql in ["", "   ", "SELEC first_name FROM customers", "SELECT 1; SELECT 2"] {
            let result = validator.validate(&candidate(sql)).await;
            assert!(
                matches!(result, ValidationResult::SyntaxError { .. }),
                "{:?} gave {:?}",
                sql,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_safety_runs_before_semantics() {
        let validator = Validator::new(catalog(), None);
        assert_eq!(
            validator.validate(&candidate("DELETE FROM customers")).await,
            ValidationResult::SafetyViolation {
                statement_type: "DELETE".to_string()
            }
        );
        assert_eq!(
            validator.validate(&candidate("DROP TABLE nosuchtable")).await,
            ValidationResult::SafetyViolation {
                statement_type: "DROP".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_column_is_semantic_error() {
        let validator = Validator::new(catalog(), None);
        assert_eq!(
            validator.validate(&candidate("SELECT nonexistent_col FROM customers")).await,
            ValidationResult::SemanticError {
                unresolved_references: BTreeSet::from(["nonexistent_col".to_string()])
            }
        );
        assert!(validator
            .validate(&candidate("SELECT first_name FROM customers;"))
            .await
            .is_valid());
    }

    #[tokio::test]
    async fn test_dry_run_rejection_becomes_semantic_error() {
        let db: Arc<dyn Database> = Arc::new(FixedDryRun(Some("no such function: median".to_string()), false));
        let validator = Validator::new(catalog(), Some(db));
        let result = validator
            .validate(&candidate("SELECT median(customer_id) FROM customers"))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Semantic));
    }

    #[tokio::test]
    async fn test_dry_run_outage_keeps_static_verdict() {
        let db: Arc<dyn Database> = Arc::new(FixedDryRun(None, true));
        let validator = Validator::new(catalog(), Some(db));
        assert!(validator
            .validate(&candidate("SELECT first_name FROM customers"))
            .await
            .is_valid());
    }

    #[test]
    fn test_detail_lists_references() {
        let result = ValidationResult::SemanticError {
            unresolved_references: BTreeSet::from(["b".to_string(), "a".to_string()]),
        };
        assert_eq!(result.detail(), "unresolved references: a, b");
        assert_eq!(result.to_string(), "semantic error: unresolved references: a, b");
    }
}
