//! Agent Prompts - instructions and context assembly for SQL generation
//!
//! The builder is pure: the same question, linked schema, feedback and
//! conversation always produce the same request.

use crate::db::SqlDialect;
use crate::schema_rag::{LinkedSchema, LinkedTable};
use crate::validation::FailureKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// System prompt for the SQL generation agent. `{dialect}` is substituted.
pub const SQL_GENERATION_SYSTEM_PROMPT: &str = r#"You are an expert data analyst who translates questions into {dialect} SQL.

## Rules

1. Produce exactly ONE read-only SELECT statement (a WITH ... SELECT is fine).
2. Never write INSERT, UPDATE, DELETE, DROP, CREATE, ALTER or any other statement that changes data or schema.
3. Use only the tables and columns listed in the schema. Do not invent names.
4. Return only the SQL, optionally inside a ```sql fenced block. No explanation.

## Guidance

- Column disambiguation: when a column name exists in several joined tables, qualify it with the table alias.
- Columns are not functions: `count` or `total` may be a column; only call functions that {dialect} provides.
- JOIN selection: use INNER JOIN when both sides must match, LEFT JOIN when rows without a match must be kept.
- Follow the foreign keys shown in the schema for join conditions.
- Project precisely: select the columns the question asks for rather than `*`.
- Respect requested ordering and limits ("top 5" means ORDER BY ... LIMIT 5).
- Compare text values exactly as the sample values show them."#;

/// Everything the generator needs for one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub question: String,
    /// Tables that survived the character budget, best first
    pub linked_schema: LinkedSchema,
    pub serialized_schema: String,
    pub system_instructions: String,
    pub prior_failure: Option<FailureFeedback>,
    pub attempt_number: u32,
    pub conversation: Vec<ConversationTurn>,
}

/// Structured description of why the previous candidate was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureFeedback {
    pub kind: FailureKind,
    pub detail: String,
    pub rejected_sql: String,
    /// "did you mean" hints for unresolved names
    pub suggestions: Vec<String>,
}

impl FailureFeedback {
    pub fn describe(&self) -> String {
        let mut parts = vec![
            format!("Failure kind: {}", self.kind),
            format!("Detail: {}", self.detail),
        ];
        if !self.rejected_sql.trim().is_empty() {
            parts.push(format!("Rejected SQL:\n{}", self.rejected_sql.trim()));
        }
        if !self.suggestions.is_empty() {
            parts.push(format!("Did you mean: {}", self.suggestions.join(", ")));
        }
        parts.push(
            match self.kind {
                FailureKind::Syntax => "Fix the syntax and return exactly one complete statement.",
                FailureKind::Safety => "Rewrite it as a read-only SELECT query.",
                FailureKind::Semantic => "Use only tables and columns that appear in the schema above.",
            }
            .to_string(),
        );
        parts.join("\n")
    }
}

/// A previous successful question of the same session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub sql: String,
}

impl GenerationRequest {
    pub fn system_message(&self) -> &str {
        &self.system_instructions
    }

    pub fn user_message(&self) -> String {
        let mut parts = Vec::new();

        parts.push("### Database schema".to_string());
        parts.push(self.serialized_schema.clone());

        if !self.conversation.is_empty() {
            parts.push("\n### Recent conversation".to_string());
            for turn in &self.conversation {
                parts.push(format!("Q: {}\nSQL: {}", turn.question, turn.sql));
            }
        }

        if let Some(ref failure) = self.prior_failure {
            parts.push(format!(
                "\n### Attempt {} was rejected",
                self.attempt_number.saturating_sub(1)
            ));
            parts.push(failure.describe());
        }

        parts.push("\n### Question".to_string());
        parts.push(self.question.clone());
        parts.push("\nSQL:".to_string());

        parts.join("\n")
    }
}

pub struct PromptBuilder {
    char_budget: usize,
    dialect: SqlDialect,
}

impl PromptBuilder {
    pub fn new(char_budget: usize, dialect: SqlDialect) -> Self {
        Self { char_budget, dialect }
    }

    pub fn build(
        &self,
        question: &str,
        linked_schema: &LinkedSchema,
        prior_failure: Option<FailureFeedback>,
        attempt_number: u32,
        conversation: &[ConversationTurn],
    ) -> GenerationRequest {
        let (fitted, serialized_schema) = self.fit_schema(linked_schema);
        GenerationRequest {
            question: question.trim().to_string(),
            linked_schema: fitted,
            serialized_schema,
            system_instructions: SQL_GENERATION_SYSTEM_PROMPT.replace("{dialect}", self.dialect.display_name()),
            prior_failure,
            attempt_number,
            conversation: conversation.to_vec(),
        }
    }

    /// Drop lowest-scored tables until the rendering fits the budget. FK
    /// clauses that point at a dropped table are left out. At least one
    /// table always remains.
    fn fit_schema(&self, linked: &LinkedSchema) -> (LinkedSchema, String) {
        let mut kept: Vec<LinkedTable> = linked.tables.clone();
        loop {
            let rendered = serialize_tables(&kept);
            if rendered.chars().count() <= self.char_budget || kept.len() <= 1 {
                if rendered.chars().count() > self.char_budget {
                    warn!(
                        "Schema for {} still exceeds {} chars with a single table",
                        kept.first().map(|t| t.table.name.as_str()).unwrap_or("?"),
                        self.char_budget
                    );
                }
                if kept.len() < linked.tables.len() {
                    debug!(
                        "Schema truncated to {} of {} tables",
                        kept.len(),
                        linked.tables.len()
                    );
                }
                let fitted = LinkedSchema {
                    tables: kept,
                    fell_back: linked.fell_back,
                };
                return (fitted, rendered);
            }
            drop_lowest_scored(&mut kept);
        }
    }
}

fn drop_lowest_scored(tables: &mut Vec<LinkedTable>) {
    // ties resolve to the later entry, which ranks lower
    let lowest = tables
        .iter()
        .enumerate()
        .fold(None::<(usize, f64)>, |acc, (idx, t)| match acc {
            Some((_, score)) if t.score > score => acc,
            _ => Some((idx, t.score)),
        })
        .map(|(idx, _)| idx);
    if let Some(idx) = lowest {
        tables.remove(idx);
    }
}

fn serialize_tables(tables: &[LinkedTable]) -> String {
    let kept: HashSet<String> = tables.iter().map(|t| t.table.name.to_lowercase()).collect();
    tables
        .iter()
        .map(|t| {
            t.table
                .to_ddl(&|fk| kept.contains(&fk.references_table.to_lowercase()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, Table};

    fn linked() -> LinkedSchema {
        let customers = Table::new(
            "customers",
            vec![
                Column::new("customer_id", "INTEGER").primary_key(),
                Column::new("first_name", "TEXT"),
            ],
        );
        let orders = Table::new(
            "orders",
            vec![
                Column::new("order_id", "INTEGER").primary_key(),
                Column::new("customer_id", "INTEGER"),
                Column::new("total_amount", "REAL"),
            ],
        )
        .with_foreign_key("customer_id", "customers", "customer_id");
        LinkedSchema {
            tables: vec![
                LinkedTable {
                    table: orders,
                    score: 0.8,
                    via_foreign_key: false,
                },
                LinkedTable {
                    table: customers,
                    score: 0.1,
                    via_foreign_key: true,
                },
            ],
            fell_back: false,
        }
    }

    #[test]
    fn test_build_within_budget_keeps_everything() {
        let builder = PromptBuilder::new(10_000, SqlDialect::Sqlite);
        let request = builder.build("  total spent per customer ", &linked(), None, 1, &[]);
        assert_eq!(request.question, "total spent per customer");
        assert_eq!(request.linked_schema.len(), 2);
        assert!(request
            .serialized_schema
            .contains("FOREIGN KEY (customer_id) REFERENCES customers(customer_id)"));
        assert!(request.system_message().contains("SQLite SQL"));
        assert!(request.prior_failure.is_none());
        assert!(request.user_message().ends_with("### Question\ntotal spent per customer\n\nSQL:"));
    }

    #[test]
    fn test_truncation_drops_lowest_score_and_its_fk_edge() {
        let full = serialize_tables(&linked().tables);
        let only_orders = linked().tables[0].table.to_ddl(&|_| false);
        assert!(only_orders.len() < full.len());

        let builder = PromptBuilder::new(only_orders.len(), SqlDialect::Sqlite);
        let request = builder.build("q", &linked(), None, 1, &[]);
        assert_eq!(request.linked_schema.table_names(), vec!["orders"]);
        assert!(!request.serialized_schema.contains("FOREIGN KEY"));
        assert!(!request.serialized_schema.contains("CREATE TABLE customers"));
    }

    #[test]
    fn test_never_drops_last_table() {
        let builder = PromptBuilder::new(10, SqlDialect::Postgres);
        let request = builder.build("q", &linked(), None, 1, &[]);
        assert_eq!(request.linked_schema.len(), 1);
        assert_eq!(request.linked_schema.tables[0].table.name, "orders");
    }

    #[test]
    fn test_retry_embeds_failure() {
        let builder = PromptBuilder::new(10_000, SqlDialect::Sqlite);
        let feedback = FailureFeedback {
            kind: FailureKind::Semantic,
            detail: "unresolved references: emial".to_string(),
            rejected_sql: "SELECT emial FROM customers".to_string(),
            suggestions: vec!["customers.email".to_string()],
        };
        let conversation = vec![ConversationTurn {
            question: "how many customers?".to_string(),
            sql: "SELECT COUNT(*) FROM customers".to_string(),
        }];
        let request = builder.build("list emails", &linked(), Some(feedback), 2, &conversation);
        let message = request.user_message();
        assert!(message.contains("### Attempt 1 was rejected"));
        assert!(message.contains("Failure kind: semantic error"));
        assert!(message.contains("Rejected SQL:\nSELECT emial FROM customers"));
        assert!(message.contains("Did you mean: customers.email"));
        assert!(message.contains("Q: how many customers?"));
    }
}
