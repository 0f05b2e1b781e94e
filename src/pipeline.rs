//! Query-synthesis pipeline
//!
//! question -> linker -> (prompt -> generator -> validator)* -> executor.
//! The catalog is extracted once at connect time and shared read-only; each
//! `ask` owns its own workflow state.

use crate::agent_prompts::PromptBuilder;
use crate::catalog::Catalog;
use crate::config::PipelineConfig;
use crate::db::{Database, ResultSet};
use crate::error::{Result, Text2SqlError};
use crate::execution_loop::{
    Attempt, CorrectionLoop, CorrectionOutcome, ErrorRecovery, ExhaustionCause, WorkflowState,
};
use crate::generator::{Candidate, SqlGenerator};
use crate::llm::LlmService;
use crate::schema_rag::{LinkedSchema, SchemaLinker};
use crate::session::{Session, Turn};
use crate::sql_engine::SqlEngine;
use crate::validation::{ValidationResult, Validator};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Successful answer to one question
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub sql: String,
    pub rows: ResultSet,
    pub attempts: u32,
    pub linked_tables: Vec<String>,
    pub history: Vec<Attempt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Connection,
    EmptySchema,
    Generation,
    Exhausted,
    Execution,
    /// Rejected `PipelineConfig`; nothing was contacted
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::EmptySchema => "EmptySchemaError",
            ErrorKind::Generation => "GenerationError",
            ErrorKind::Exhausted => "Exhausted",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::Config => "ConfigError",
        };
        write!(f, "{}", name)
    }
}

/// Structured failure of `ask`, always distinguishable from an `Answer`
#[derive(Error, Debug, Clone, Serialize)]
#[error("{kind}: {detail}")]
pub struct AskFailure {
    pub kind: ErrorKind,
    pub detail: String,
    pub last_candidate: Option<Candidate>,
    /// Why the last candidate was rejected, when it was
    pub last_result: Option<ValidationResult>,
    pub history: Vec<Attempt>,
}

impl AskFailure {
    fn bare(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            last_candidate: None,
            last_result: None,
            history: Vec::new(),
        }
    }

    fn from_workflow(kind: ErrorKind, detail: String, workflow: WorkflowState) -> Self {
        let last = workflow.history.last().cloned();
        Self {
            kind,
            detail,
            last_candidate: workflow.candidate.or_else(|| last.as_ref().map(|a| a.candidate.clone())),
            last_result: last.map(|a| a.result),
            history: workflow.history,
        }
    }
}

impl From<Text2SqlError> for AskFailure {
    fn from(e: Text2SqlError) -> Self {
        let kind = match e {
            Text2SqlError::EmptySchema => ErrorKind::EmptySchema,
            Text2SqlError::Generation(_) => ErrorKind::Generation,
            Text2SqlError::Execution(_) => ErrorKind::Execution,
            Text2SqlError::Config(_) => ErrorKind::Config,
            _ => ErrorKind::Connection,
        };
        AskFailure::bare(kind, e.to_string())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    catalog: Arc<Catalog>,
    linker: SchemaLinker,
    prompts: PromptBuilder,
    generator: SqlGenerator,
    validator: Validator,
    recovery: ErrorRecovery,
    engine: SqlEngine,
    llm: Arc<dyn LlmService>,
}

impl Pipeline {
    /// Extract the catalog and wire every stage to it.
    pub async fn connect(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmService>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(Catalog::extract(db.as_ref(), config.sample_values).await?);
        Ok(Self::with_catalog(db, llm, config, catalog))
    }

    /// Wire the stages to an already extracted catalog.
    pub fn with_catalog(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmService>,
        config: PipelineConfig,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            linker: SchemaLinker::new(Arc::clone(&catalog), config.link_top_k, config.link_min_similarity),
            prompts: PromptBuilder::new(config.schema_char_budget, catalog.dialect()),
            generator: SqlGenerator::new(Arc::clone(&llm), config.llm_timeout),
            validator: Validator::new(Arc::clone(&catalog), Some(Arc::clone(&db))),
            recovery: ErrorRecovery::new(Arc::clone(&catalog)),
            engine: SqlEngine::new(db, config.max_rows, config.execution_timeout),
            catalog,
            config,
            llm,
        }
    }

    /// Point the pipeline at another connection; the catalog is rebuilt.
    pub async fn reconnect(&mut self, db: Arc<dyn Database>) -> Result<()> {
        let rebuilt = Self::connect(db, Arc::clone(&self.llm), self.config.clone()).await?;
        *self = rebuilt;
        info!("Catalog rebuilt after reconnect");
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn link(&self, question: &str) -> LinkedSchema {
        self.linker.link(question)
    }

    /// Answer one question. Appends a turn to `session` whatever the outcome.
    pub async fn ask(&self, question: &str, session: &mut Session) -> std::result::Result<Answer, AskFailure> {
        let question = question.trim();
        info!("Question: {}", question);

        let linked = self.linker.link(question);
        let linked_tables: Vec<String> = linked.table_names().into_iter().map(String::from).collect();
        info!(
            "Linked {} table(s){}: {:?}",
            linked_tables.len(),
            if linked.fell_back { " (full catalog)" } else { "" },
            linked_tables
        );

        let conversation = session.recent_context(self.config.conversation_turns);
        let outcome = CorrectionLoop::new(
            &self.generator,
            &self.validator,
            &self.prompts,
            &self.recovery,
            self.config.max_correction_attempts,
        )
        .run(question, linked, &conversation)
        .await;

        let result = match outcome {
            CorrectionOutcome::Succeeded(workflow) => self.execute(workflow, linked_tables).await,
            CorrectionOutcome::Exhausted { workflow, cause } => {
                let (kind, detail) = match cause {
                    ExhaustionCause::Generation(msg) => (ErrorKind::Generation, msg),
                    ExhaustionCause::AttemptBudget => (
                        ErrorKind::Exhausted,
                        format!(
                            "no valid SQL after {} attempt(s); last rejection: {}",
                            workflow.history.len(),
                            workflow
                                .last_attempt()
                                .map(|a| a.result.to_string())
                                .unwrap_or_default()
                        ),
                    ),
                };
                warn!("{}: {}", kind, detail);
                Err(AskFailure::from_workflow(kind, detail, workflow))
            }
        };

        session.record(match &result {
            Ok(answer) => Turn {
                question: question.to_string(),
                sql: Some(answer.sql.clone()),
                succeeded: true,
                row_count: Some(answer.rows.row_count()),
                asked_at: Utc::now(),
            },
            Err(failure) => Turn {
                question: question.to_string(),
                sql: failure.last_candidate.as_ref().map(|c| c.sql.clone()),
                succeeded: false,
                row_count: None,
                asked_at: Utc::now(),
            },
        });
        result
    }

    async fn execute(
        &self,
        workflow: WorkflowState,
        linked_tables: Vec<String>,
    ) -> std::result::Result<Answer, AskFailure> {
        let (Some(candidate), Some(validation)) = (workflow.candidate.clone(), workflow.validation.clone()) else {
            return Err(AskFailure::from_workflow(
                ErrorKind::Execution,
                "no validated candidate to execute".to_string(),
                workflow,
            ));
        };

        match self.engine.execute(&candidate, &validation).await {
            Ok(rows) => Ok(Answer {
                sql: candidate.sql,
                rows,
                attempts: workflow.attempt_number,
                linked_tables,
                history: workflow.history,
            }),
            Err(e) => {
                warn!("Execution failed: {}", e);
                Err(AskFailure::from_workflow(ErrorKind::Execution, e.to_string(), workflow))
            }
        }
    }
}

/// One-shot entry point: extract the catalog from `db`, then answer.
/// Connection and empty-schema problems come back as `AskFailure`.
pub async fn ask(
    question: &str,
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmService>,
    config: PipelineConfig,
    session: &mut Session,
) -> std::result::Result<Answer, AskFailure> {
    let pipeline = Pipeline::connect(db, llm, config).await?;
    pipeline.ask(question, session).await
}
