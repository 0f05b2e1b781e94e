//! Error Recovery
//!
//! Turns a rejected candidate into the feedback embedded in the next prompt.
//! Semantic failures get "did you mean" hints drawn from the whole catalog.

use crate::agent_prompts::FailureFeedback;
use crate::catalog::Catalog;
use crate::generator::Candidate;
use crate::validation::ValidationResult;
use std::sync::Arc;
use strsim::jaro_winkler;

const SUGGESTION_THRESHOLD: f64 = 0.85;
const MAX_SUGGESTIONS_PER_REFERENCE: usize = 3;

pub struct ErrorRecovery {
    catalog: Arc<Catalog>,
}

impl ErrorRecovery {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// `None` for a valid candidate
    pub fn feedback(&self, candidate: &Candidate, result: &ValidationResult) -> Option<FailureFeedback> {
        let kind = result.failure_kind()?;
        let suggestions = match result {
            ValidationResult::SemanticError { unresolved_references } => unresolved_references
                .iter()
                .flat_map(|reference| self.suggest(reference))
                .collect(),
            _ => Vec::new(),
        };
        Some(FailureFeedback {
            kind,
            detail: result.detail(),
            rejected_sql: candidate.sql.clone(),
            suggestions,
        })
    }

    /// Closest catalog names for an unresolved `name` or `qualifier.name`
    pub fn suggest(&self, reference: &str) -> Vec<String> {
        let needle = reference.rsplit('.').next().unwrap_or(reference).to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, String)> = Vec::new();
        for table in self.catalog.tables() {
            let score = jaro_winkler(&needle, &table.name.to_lowercase());
            if score >= SUGGESTION_THRESHOLD {
                scored.push((score, table.name.clone()));
            }
        }
        for (table, column) in self.catalog.qualified_columns() {
            let score = jaro_winkler(&needle, &column.to_lowercase());
            if score >= SUGGESTION_THRESHOLD {
                scored.push((score, format!("{}.{}", table, column)));
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS_PER_REFERENCE)
            .map(|(_, name)| format!("{} -> {}", reference, name))
            .collect()
    }
}
