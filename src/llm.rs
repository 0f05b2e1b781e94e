use crate::agent_prompts::GenerationRequest;
use crate::config::LlmConfig;
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Text-completion capability: one request in, free text out.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Text2SqlError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": request.system_message()},
                {"role": "user", "content": request.user_message()}
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens
        })
    }
}

#[async_trait]
impl LlmService for OpenAiClient {
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        debug!(
            "Calling {} (attempt {})",
            self.config.model, request.attempt_number
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| Text2SqlError::Generation(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Text2SqlError::Generation(format!(
                "LLM API returned {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Text2SqlError::Generation(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Text2SqlError::Generation("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}
