//! Pipeline and LLM configuration
//!
//! Values come from defaults, then environment variables (a `.env` file is
//! honoured by the binary through `dotenv`), then CLI overrides.

use crate::error::{Result, Text2SqlError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Knobs consumed by the query-synthesis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on generation calls per question (>= 1)
    pub max_correction_attempts: u32,

    /// Number of top-scored tables kept by the schema linker (>= 1)
    pub link_top_k: usize,

    /// A table must score strictly above this to be linked
    pub link_min_similarity: f64,

    /// Character budget for the serialized schema in the prompt
    pub schema_char_budget: usize,

    pub llm_timeout: Duration,

    pub execution_timeout: Duration,

    /// Row cap applied by the executor
    pub max_rows: usize,

    /// Distinct sample values collected per column during catalog extraction
    pub sample_values: usize,

    /// Prior successful turns of the session shown to the model
    pub conversation_turns: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_correction_attempts: 3,
            link_top_k: 3,
            link_min_similarity: 0.0,
            schema_char_budget: 6000,
            llm_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(15),
            max_rows: 1000,
            sample_values: 3,
            conversation_turns: 3,
        }
    }
}

impl PipelineConfig {
    /// Load from `TEXT2SQL_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_correction_attempts: env_or("TEXT2SQL_MAX_CORRECTION_ATTEMPTS", defaults.max_correction_attempts)?,
            link_top_k: env_or("TEXT2SQL_LINK_TOP_K", defaults.link_top_k)?,
            link_min_similarity: env_or("TEXT2SQL_LINK_MIN_SIMILARITY", defaults.link_min_similarity)?,
            schema_char_budget: env_or("TEXT2SQL_SCHEMA_CHAR_BUDGET", defaults.schema_char_budget)?,
            llm_timeout: Duration::from_secs(env_or("TEXT2SQL_LLM_TIMEOUT_SECS", defaults.llm_timeout.as_secs())?),
            execution_timeout: Duration::from_secs(env_or(
                "TEXT2SQL_EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout.as_secs(),
            )?),
            max_rows: env_or("TEXT2SQL_MAX_ROWS", defaults.max_rows)?,
            sample_values: env_or("TEXT2SQL_SAMPLE_VALUES", defaults.sample_values)?,
            conversation_turns: env_or("TEXT2SQL_CONVERSATION_TURNS", defaults.conversation_turns)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_correction_attempts < 1 {
            return Err(Text2SqlError::Config("max_correction_attempts must be at least 1".to_string()));
        }
        if self.link_top_k < 1 {
            return Err(Text2SqlError::Config("link_top_k must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.link_min_similarity) {
            return Err(Text2SqlError::Config(format!(
                "link_min_similarity must be in [0, 1), got {}",
                self.link_min_similarity
            )));
        }
        if self.schema_char_budget == 0 {
            return Err(Text2SqlError::Config("schema_char_budget must be positive".to_string()));
        }
        if self.max_rows == 0 {
            return Err(Text2SqlError::Config("max_rows must be positive".to_string()));
        }
        if self.llm_timeout.is_zero() || self.execution_timeout.is_zero() {
            return Err(Text2SqlError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Connection settings for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            max_tokens: 1000,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_key(None)
    }

    /// Like `from_env`, but an explicit key wins over `OPENAI_API_KEY`.
    pub fn from_env_with_key(api_key: Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| Text2SqlError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let config = Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
            temperature: env_or("LLM_TEMPERATURE", defaults.temperature)?,
            max_tokens: env_or("LLM_MAX_TOKENS", defaults.max_tokens)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Text2SqlError::Config("LLM api key is empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Text2SqlError::Config(format!(
                "temperature must be in [0, 2], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(Text2SqlError::Config("max_tokens must be positive".to_string()));
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Text2SqlError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
