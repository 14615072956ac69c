//! Chat-completion provider for the reasoning client.
//!
//! Auto-detects an OpenAI-compatible or Anthropic provider from environment
//! variables and implements [`TextGenerator`] over it.

use super::TextGenerator;
use crate::types::ReasoningError;
use async_trait::async_trait;
use std::time::Duration;

/// Supported upstream providers.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenRouter,
    OpenAi,
    Anthropic,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::OpenRouter => write!(f, "openrouter"),
            Provider::OpenAi => write!(f, "openai"),
            Provider::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Chat-completions client speaking either the OpenAI or Anthropic wire
/// protocol depending on the detected provider.
pub struct ChatCompletionClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    provider: Provider,
    label: String,
}

impl ChatCompletionClient {
    /// Auto-detect a provider from environment variables, checked in order:
    ///
    /// 1. `OPENROUTER_API_KEY` (model from `OPENROUTER_MODEL`)
    /// 2. `OPENAI_API_KEY` (model from `OPENAI_MODEL`)
    /// 3. `ANTHROPIC_API_KEY` (model from `ANTHROPIC_MODEL`)
    ///
    /// Returns `None` when no key is present; the orchestrator then runs
    /// rule-only.
    pub fn from_env() -> Option<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .ok()?;

        if let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") {
            let model = std::env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-sonnet-4".to_string());
            let base_url = std::env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());
            return Some(Self::assemble(client, api_key, base_url, model, Provider::OpenRouter));
        }

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            return Some(Self::assemble(client, api_key, base_url, model, Provider::OpenAi));
        }

        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            let model = std::env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string());
            let base_url = std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string());
            return Some(Self::assemble(client, api_key, base_url, model, Provider::Anthropic));
        }

        tracing::info!("no reasoning provider key in environment, running rule-only");
        None
    }

    fn assemble(
        client: reqwest::Client,
        api_key: String,
        base_url: String,
        model: String,
        provider: Provider,
    ) -> Self {
        tracing::info!(%provider, model = %model, "reasoning provider initialized");
        let label = format!("{}:{}", provider, model);
        Self {
            client,
            api_key,
            base_url,
            model,
            provider,
            label,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn openai_completion(&self, system: &str, user: &str) -> Result<String, ReasoningError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "max_tokens": 2048,
            "temperature": 0.1
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ReasoningError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ReasoningError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ReasoningError::RequestFailed(format!("malformed reply: {}", e)))?;

        reply
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ReasoningError::RequestFailed("no content in reply choices".into()))
    }

    async fn anthropic_completion(
        &self,
        system: &str,
        user: &str,
    ) -> Result<String, ReasoningError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 2048,
            "system": system,
            "messages": [{ "role": "user", "content": user }]
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ReasoningError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ReasoningError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ReasoningError::RequestFailed(format!("malformed reply: {}", e)))?;

        // Anthropic returns content as an array of blocks.
        reply
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ReasoningError::RequestFailed("no text block in reply".into()))
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionClient {
    async fn generate(&self, system: &str, user: &str) -> Result<String, ReasoningError> {
        match self.provider {
            Provider::Anthropic => self.anthropic_completion(system, user).await,
            _ => self.openai_completion(system, user).await,
        }
    }

    fn provider_name(&self) -> &str {
        &self.label
    }
}
