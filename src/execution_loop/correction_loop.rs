//! Self-Correction Loop
//!
//! Explicit state machine around generator and validator:
//! `Generating -> Validating -> {Succeeded, Retrying, Exhausted}`, with
//! `Retrying -> Generating`. At most `max_attempts` generation calls.

use crate::agent_prompts::{ConversationTurn, FailureFeedback, PromptBuilder};
use crate::execution_loop::error_recovery::ErrorRecovery;
use crate::generator::{Candidate, SqlGenerator};
use crate::schema_rag::LinkedSchema;
use crate::validation::{ValidationResult, Validator};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Generating,
    Validating,
    Retrying,
    Succeeded,
    Exhausted,
}

/// One validated candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub candidate: Candidate,
    pub result: ValidationResult,
}

/// Mutable record for one question, touched only by the loop between stages
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    pub question: String,
    pub linked_schema: LinkedSchema,
    pub candidate: Option<Candidate>,
    pub validation: Option<ValidationResult>,
    pub attempt_number: u32,
    pub history: Vec<Attempt>,
    pub state: LoopState,
}

impl WorkflowState {
    pub fn new(question: &str, linked_schema: LinkedSchema) -> Self {
        Self {
            question: question.to_string(),
            linked_schema,
            candidate: None,
            validation: None,
            attempt_number: 1,
            history: Vec::new(),
            state: LoopState::Generating,
        }
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.history.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExhaustionCause {
    /// Every attempt failed validation
    AttemptBudget,
    /// The generator failed; not a correctable SQL defect
    Generation(String),
}

#[derive(Debug, Clone)]
pub enum CorrectionOutcome {
    /// `workflow.candidate` validated as `Valid`
    Succeeded(WorkflowState),
    Exhausted {
        workflow: WorkflowState,
        cause: ExhaustionCause,
    },
}

pub struct CorrectionLoop<'a> {
    generator: &'a SqlGenerator,
    validator: &'a Validator,
    prompts: &'a PromptBuilder,
    recovery: &'a ErrorRecovery,
    max_attempts: u32,
}

impl<'a> CorrectionLoop<'a> {
    pub fn new(
        generator: &'a SqlGenerator,
        validator: &'a Validator,
        prompts: &'a PromptBuilder,
        recovery: &'a ErrorRecovery,
        max_attempts: u32,
    ) -> Self {
        Self {
            generator,
            validator,
            prompts,
            recovery,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run(
        &self,
        question: &str,
        linked_schema: LinkedSchema,
        conversation: &[ConversationTurn],
    ) -> CorrectionOutcome {
        let mut workflow = WorkflowState::new(question, linked_schema);
        let mut feedback: Option<FailureFeedback> = None;

        loop {
            match workflow.state {
                LoopState::Generating => {
                    info!(
                        "Generation attempt {} of {}",
                        workflow.attempt_number, self.max_attempts
                    );
                    let request = self.prompts.build(
                        &workflow.question,
                        &workflow.linked_schema,
                        feedback.take(),
                        workflow.attempt_number,
                        conversation,
                    );
                    match self.generator.generate(&request).await {
                        Ok(candidate) => {
                            workflow.candidate = Some(candidate);
                            workflow.state = LoopState::Validating;
                        }
                        Err(e) => {
                            warn!("Generation failed on attempt {}: {}", workflow.attempt_number, e);
                            workflow.state = LoopState::Exhausted;
                            return CorrectionOutcome::Exhausted {
                                workflow,
                                cause: ExhaustionCause::Generation(e.to_string()),
                            };
                        }
                    }
                }
                LoopState::Validating => {
                    let Some(candidate) = workflow.candidate.clone() else {
                        workflow.state = LoopState::Generating;
                        continue;
                    };
                    let result = self.validator.validate(&candidate).await;
                    workflow.history.push(Attempt {
                        candidate: candidate.clone(),
                        result: result.clone(),
                    });

                    workflow.state = if result.is_valid() {
                        LoopState::Succeeded
                    } else if workflow.attempt_number < self.max_attempts {
                        info!("Attempt {} rejected: {}", workflow.attempt_number, result);
                        feedback = self.recovery.feedback(&candidate, &result);
                        LoopState::Retrying
                    } else {
                        warn!("Attempt {} rejected, budget spent: {}", workflow.attempt_number, result);
                        LoopState::Exhausted
                    };
                    workflow.validation = Some(result);
                }
                LoopState::Retrying => {
                    workflow.attempt_number += 1;
                    workflow.candidate = None;
                    workflow.validation = None;
                    workflow.state = LoopState::Generating;
                }
                LoopState::Succeeded => {
                    info!("Candidate validated on attempt {}", workflow.attempt_number);
                    return CorrectionOutcome::Succeeded(workflow);
                }
                LoopState::Exhausted => {
                    return CorrectionOutcome::Exhausted {
                        workflow,
                        cause: ExhaustionCause::AttemptBudget,
                    };
                }
            }
        }
    }
}
