//! Caller-owned conversational state
//!
//! The pipeline itself keeps nothing between questions; a `Session` is
//! passed into `ask` and only ever appended to.

use crate::agent_prompts::ConversationTurn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    /// Final SQL, when one was produced
    pub sql: Option<String>,
    pub succeeded: bool,
    pub row_count: Option<usize>,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: Uuid,
    turns: Vec<Turn>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            turns: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn record(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// The last `limit` successful turns, oldest first
    pub fn recent_context(&self, limit: usize) -> Vec<ConversationTurn> {
        let mut recent: Vec<ConversationTurn> = self
            .turns
            .iter()
            .rev()
            .filter(|t| t.succeeded)
            .filter_map(|t| {
                t.sql.as_ref().map(|sql| ConversationTurn {
                    question: t.question.clone(),
                    sql: sql.clone(),
                })
            })
            .take(limit)
            .collect();
        recent.reverse();
        recent
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
