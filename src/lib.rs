pub mod agent_prompts;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod execution_loop;
pub mod generator;
pub mod llm;
pub mod pipeline;
pub mod schema_rag;
pub mod session;
pub mod sql_engine;
pub mod validation;

pub use catalog::{Catalog, Column, ForeignKey, Table};
pub use config::{LlmConfig, PipelineConfig};
pub use db::{Database, PostgresDatabase, ResultSet, SqlDialect, SqliteDatabase};
pub use error::{Result, Text2SqlError};
pub use generator::Candidate;
pub use llm::{LlmService, OpenAiClient};
pub use pipeline::{ask, Answer, AskFailure, ErrorKind, Pipeline};
pub use session::{Session, Turn};
pub use validation::ValidationResult;
