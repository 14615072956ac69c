//! Remote agent adapter.
//!
//! Wraps an HTTP endpoint as an [`Agent`]: the merged input is POSTed as
//! JSON and the reply body is the agent output. Transport faults map onto
//! the retryable error classes so the retry core treats remote agents the
//! same as in-process ones.

use super::{Agent, InvocationContext};
use crate::types::AgentError;
use async_trait::async_trait;
use std::time::Duration;

pub struct HttpAgent {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Failed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        })
    }

    async fn post(&self, input: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(Duration::ZERO)
                } else {
                    AgentError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AgentError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AgentError::Failed(format!("malformed agent reply: {}", e)))
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        ctx: &InvocationContext,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.post(input) => result,
        }
    }
}
