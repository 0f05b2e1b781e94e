//! SQL Generator
//!
//! One LLM call per attempt, no retries here. The first SQL statement is
//! pulled out of whatever prose or markdown the model wraps around it.

use crate::agent_prompts::GenerationRequest;
use crate::error::{Result, Text2SqlError};
use crate::llm::LlmService;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap();
    static ref STATEMENT_START: Regex = Regex::new(
        r"(?i)^(SELECT|WITH|INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|TRUNCATE|REPLACE|MERGE|GRANT|PRAGMA|ATTACH|VALUES|EXPLAIN)\b"
    )
    .unwrap();
    static ref LABEL_PREFIX: Regex = Regex::new(r"(?i)^(sql|query|answer)\s*:\s*").unwrap();
}

/// A generated statement; never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub sql: String,
    pub attempt_number: u32,
}

pub struct SqlGenerator {
    llm: Arc<dyn LlmService>,
    timeout: Duration,
}

impl SqlGenerator {
    pub fn new(llm: Arc<dyn LlmService>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Fails with `Generation` on service error, timeout or an empty reply.
    /// A reply without a recognisable statement yields an empty candidate.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Candidate> {
        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| Text2SqlError::Generation(format!("LLM call timed out after {:?}", self.timeout)))?
            .map_err(|e| match e {
                Text2SqlError::Generation(_) => e,
                other => Text2SqlError::Generation(other.to_string()),
            })?;

        if response.trim().is_empty() {
            return Err(Text2SqlError::Generation("LLM returned an empty response".to_string()));
        }

        let sql = extract_sql(&response).unwrap_or_else(|| {
            warn!("No SQL statement found in model output");
            String::new()
        });
        debug!("Attempt {} candidate: {}", request.attempt_number, sql);

        Ok(Candidate {
            sql,
            attempt_number: request.attempt_number,
        })
    }
}

/// Extract the first SQL statement from free-form model output.
pub fn extract_sql(response: &str) -> Option<String> {
    let fenced = FENCED_BLOCK
        .captures_iter(response)
        .map(|caps| caps[1].trim().to_string())
        .find(|block| {
            block
                .lines()
                .map(|l| LABEL_PREFIX.replace(l.trim(), "").to_string())
                .any(|l| STATEMENT_START.is_match(&l))
        });

    let statement = match fenced {
        Some(block) => statement_from_lines(&block, false)?,
        None => statement_from_lines(response, true)?,
    };
    let statement = first_statement(&statement).trim().to_string();
    if statement.is_empty() {
        None
    } else {
        Some(statement)
    }
}

/// Lines from the first statement keyword on; prose stops at a blank line
fn statement_from_lines(text: &str, stop_at_blank: bool) -> Option<String> {
    let mut lines = text.lines().map(str::trim_end);
    let first = lines.find_map(|line| {
        let stripped = LABEL_PREFIX.replace(line.trim(), "").to_string();
        if STATEMENT_START.is_match(&stripped) {
            Some(stripped)
        } else {
            None
        }
    })?;

    let mut collected = vec![first];
    for line in lines {
        if (stop_at_blank && line.trim().is_empty()) || line.trim_start().starts_with("```") {
            break;
        }
        collected.push(line.to_string());
    }
    Some(collected.join("\n"))
}

/// Cut at the first `;` outside quotes and comments
fn first_statement(sql: &str) -> &str {
    let bytes = sql.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                    continue;
                }
                b';' => return &sql[..i],
                _ => {}
            },
        }
        i += 1;
    }
    sql
}
