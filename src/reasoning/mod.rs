//! Reasoning client: typed operations over an external text-generation
//! service.
//!
//! The client is stateless and exposes the three operations consumed by
//! the hybrid reasoner (`select`, `validate`, `extract_parameters`) plus
//! the soft relevance judgment used by the response validator. Service output
//! is parsed with a strict JSON decoder after markdown-fence stripping;
//! parse failures and missing contract fields degrade to a low-confidence
//! verdict instead of erroring. With no provider configured the system runs
//! rule-only.

pub mod provider;

use crate::exec::retry::{retry_with_backoff, RetryConfig};
use crate::types::{AgentDescriptor, AgentError, PlanParameters, ReasoningError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Minimal "generate text" interface the reasoning layer consumes.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, ReasoningError>;

    /// Short label for health reporting.
    fn provider_name(&self) -> &str;
}

/// Verdict returned by `validate` and `select`.
#[derive(Debug, Clone)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_agents: Vec<String>,
    pub parameters: PlanParameters,
}

impl ValidationVerdict {
    /// The degenerate verdict used when the service reply is unparseable or
    /// missing contract fields.
    pub fn low_confidence(reasoning: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            confidence: 0.0,
            reasoning: reasoning.into(),
            suggested_agents: Vec::new(),
            parameters: PlanParameters::new(),
        }
    }
}

/// Soft signal from the model-assisted hallucination check.
#[derive(Debug, Clone)]
pub struct RelevanceJudgment {
    pub relevant: bool,
    pub confidence: f64,
}

/// Raw wire shape of a verdict; every field optional so partial replies
/// degrade instead of failing deserialization.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_valid: Option<bool>,
    confidence: Option<f64>,
    reasoning: Option<String>,
    #[serde(default)]
    suggested_agents: Option<Vec<String>>,
    #[serde(default)]
    parameters: Option<PlanParameters>,
}

#[derive(Debug, Deserialize)]
struct RawRelevance {
    relevant: Option<bool>,
    confidence: Option<f64>,
}

/// Strip a single surrounding markdown code fence, if present.
pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches(['\r', '\n']);
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Client over a [`TextGenerator`] with its own small retry budget and a
/// hard per-call timeout.
pub struct ReasoningClient {
    generator: Option<Arc<dyn TextGenerator>>,
    retry: RetryConfig,
    timeout: Duration,
}

impl ReasoningClient {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>, timeout: Duration) -> Self {
        Self {
            generator,
            retry: RetryConfig {
                max_retries: 1,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(500),
                exponential_base: 2.0,
            },
            timeout,
        }
    }

    /// Client with no provider: always degraded.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(10))
    }

    pub fn is_available(&self) -> bool {
        self.generator.is_some()
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.generator.as_deref().map(|g| g.provider_name())
    }

    /// Validate a rule-derived agent selection and extract per-agent
    /// parameters in the same call. `None` means the service is
    /// unavailable and the caller must degrade to rule-only behavior.
    pub async fn validate(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
        selected_agents: &[String],
        registry_snapshot: &[AgentDescriptor],
    ) -> Option<ValidationVerdict> {
        let system = format!(
            "You validate agent selections for a request orchestrator.\n\
             Registered agents:\n{}\n\
             Reply with strict JSON only: {{\"is_valid\": bool, \"confidence\": number 0..1, \
             \"reasoning\": string, \"suggested_agents\": [string], \
             \"parameters\": {{agent_name: {{param: value}}}}}}.\n\
             If the selection is wrong, set is_valid=false and suggest better agents. \
             Extract concrete per-agent parameters from the request.",
            describe_agents(registry_snapshot)
        );
        let user = format!(
            "Request: {}\nSelected agents: {:?}",
            serde_json::Value::Object(input.clone()),
            selected_agents
        );
        self.call_for_verdict(&system, &user).await
    }

    /// Select agents from scratch (no rule matched, or rule confidence was
    /// below threshold). The verdict's `suggested_agents` carry the choice.
    pub async fn select(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
        registry_snapshot: &[AgentDescriptor],
    ) -> Option<ValidationVerdict> {
        let system = format!(
            "You select agents for a request orchestrator.\n\
             Registered agents:\n{}\n\
             Reply with strict JSON only: {{\"is_valid\": bool, \"confidence\": number 0..1, \
             \"reasoning\": string, \"suggested_agents\": [string], \
             \"parameters\": {{agent_name: {{param: value}}}}}}.\n\
             suggested_agents must name registered agents that can handle the request; \
             use an empty list if none can. Extract concrete per-agent parameters.",
            describe_agents(registry_snapshot)
        );
        let user = format!("Request: {}", serde_json::Value::Object(input.clone()));
        self.call_for_verdict(&system, &user).await
    }

    /// Extract per-agent parameters for an already-final agent list. Used
    /// when a validate call came back without parameters.
    pub async fn extract_parameters(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
        selected_agents: &[String],
    ) -> Option<PlanParameters> {
        let system = "You extract per-agent input parameters for a request orchestrator.\n\
             Reply with strict JSON only: {\"parameters\": {agent_name: {param: value}}}.\n\
             Include an entry for every listed agent; omit parameters you cannot derive."
            .to_string();
        let user = format!(
            "Request: {}\nAgents: {:?}",
            serde_json::Value::Object(input.clone()),
            selected_agents
        );
        let text = self.generate_with_retry(&system, &user).await?;
        let cleaned = strip_markdown_fences(&text);
        match serde_json::from_str::<RawVerdict>(&cleaned) {
            Ok(raw) => Some(raw.parameters.unwrap_or_default()),
            Err(e) => {
                tracing::warn!(error = %e, "parameter extraction reply was not valid JSON");
                Some(PlanParameters::new())
            }
        }
    }

    /// Yes/no-with-confidence relevance judgment on an agent response.
    /// A soft signal only; `None` when unavailable or unparseable.
    pub async fn assess_relevance(
        &self,
        query: &str,
        agent_name: &str,
        data: &serde_json::Value,
    ) -> Option<RelevanceJudgment> {
        let system = "You judge whether an agent response is relevant to a user request.\n\
             Reply with strict JSON only: {\"relevant\": bool, \"confidence\": number 0..1}."
            .to_string();
        let user = format!(
            "Request: {}\nAgent: {}\nResponse: {}",
            query, agent_name, data
        );
        let text = self.generate_with_retry(&system, &user).await?;
        let cleaned = strip_markdown_fences(&text);
        match serde_json::from_str::<RawRelevance>(&cleaned) {
            Ok(RawRelevance {
                relevant: Some(relevant),
                confidence: Some(confidence),
            }) => Some(RelevanceJudgment {
                relevant,
                confidence: confidence.clamp(0.0, 1.0),
            }),
            _ => None,
        }
    }

    async fn call_for_verdict(&self, system: &str, user: &str) -> Option<ValidationVerdict> {
        let text = self.generate_with_retry(system, user).await?;
        Some(Self::parse_verdict(&text))
    }

    /// Returns `None` only when the service is unavailable (no provider, or
    /// every attempt failed); the caller then degrades to rule-only.
    async fn generate_with_retry(&self, system: &str, user: &str) -> Option<String> {
        let generator = self.generator.as_ref()?;
        let outcome = retry_with_backoff(&self.retry, "reasoning", |_| async {
            match tokio::time::timeout(self.timeout, generator.generate(system, user)).await {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(reasoning_to_agent_error(e)),
                Err(_) => Err(AgentError::Timeout(self.timeout)),
            }
        })
        .await;
        match outcome.result {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(error = %e, "reasoning service unavailable, degrading to rule-only");
                None
            }
        }
    }

    fn parse_verdict(text: &str) -> ValidationVerdict {
        let cleaned = strip_markdown_fences(text);
        let raw: RawVerdict = match serde_json::from_str(&cleaned) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "verdict reply was not valid JSON");
                return ValidationVerdict::low_confidence("unparseable reasoning reply");
            }
        };
        let (is_valid, confidence) = match (raw.is_valid, raw.confidence) {
            (Some(v), Some(c)) => (v, c.clamp(0.0, 1.0)),
            _ => {
                tracing::warn!("verdict reply missing contract fields");
                return ValidationVerdict::low_confidence("incomplete reasoning reply");
            }
        };
        ValidationVerdict {
            is_valid,
            confidence,
            reasoning: raw.reasoning.unwrap_or_default(),
            suggested_agents: raw.suggested_agents.unwrap_or_default(),
            parameters: raw.parameters.unwrap_or_default(),
        }
    }
}

fn describe_agents(snapshot: &[AgentDescriptor]) -> String {
    snapshot
        .iter()
        .map(|d| {
            format!(
                "- {} [{}]: {}",
                d.name,
                d.capabilities.join(", "),
                d.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn reasoning_to_agent_error(err: ReasoningError) -> AgentError {
    match err {
        ReasoningError::Timeout(d) => AgentError::Timeout(d),
        ReasoningError::RequestFailed(msg) => AgentError::Network(msg),
        ReasoningError::Upstream { status, message } => AgentError::Upstream { status, message },
        ReasoningError::Unavailable => AgentError::Failed("no provider".into()),
    }
}
