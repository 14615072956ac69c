//! Response validation.
//!
//! Three phases: per-agent JSON-Schema checks, deterministic cross-agent
//! consistency rules, and hallucination heuristics (rule-based, plus an
//! optional model-assisted soft signal). The phases feed an internal
//! confidence score; the report's `is_valid` drives the orchestrator's
//! re-execution loop. The score never leaves the server.

pub mod schema;

pub use schema::SchemaCatalogue;

use crate::reasoning::ReasoningClient;
use crate::registry::CapabilityRegistry;
use crate::types::{
    AgentResponse, AgentValidation, SelectionPlan, ValidationReport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Validator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Reports scoring below this are invalid.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// How many times the orchestrator may re-execute an invalid plan.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ask the reasoning client for a relevance judgment per agent output.
    #[serde(default)]
    pub enable_model_assisted: bool,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_max_retries() -> u32 {
    2
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_retries: default_max_retries(),
            enable_model_assisted: false,
        }
    }
}

const SCHEMA_FAIL_PENALTY: f64 = 0.3;
const CONSISTENCY_PENALTY: f64 = 0.2;
const RULE_HALLUCINATION_PENALTY: f64 = 0.4;
const MODEL_HALLUCINATION_PENALTY: f64 = 0.2;

pub struct ResponseValidator {
    catalogue: Arc<SchemaCatalogue>,
    registry: Arc<CapabilityRegistry>,
    reasoning: Arc<ReasoningClient>,
    config: ValidationConfig,
}

impl ResponseValidator {
    pub fn new(
        catalogue: Arc<SchemaCatalogue>,
        registry: Arc<CapabilityRegistry>,
        reasoning: Arc<ReasoningClient>,
        config: ValidationConfig,
    ) -> Self {
        Self {
            catalogue,
            registry,
            reasoning,
            config,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Validate the collected responses against the plan and the original
    /// query.
    pub async fn validate(
        &self,
        query: &str,
        plan: &SelectionPlan,
        responses: &[AgentResponse],
    ) -> ValidationReport {
        let mut report = ValidationReport::accept_all();
        let mut schema_failed = false;

        // Phase A: per-agent schema validation.
        for response in responses.iter().filter(|r| r.success) {
            let mut validation = AgentValidation {
                schema_pass: true,
                issues: Vec::new(),
            };
            if let Some(schema_name) = self
                .registry
                .lookup(&response.agent_name)
                .ok()
                .and_then(|d| d.output_schema_name)
            {
                match self.catalogue.check(&schema_name, &response.data) {
                    Ok(issues) if issues.is_empty() => {}
                    Ok(issues) => {
                        validation.schema_pass = false;
                        validation.issues = issues;
                        schema_failed = true;
                    }
                    Err(e) => {
                        validation.schema_pass = false;
                        validation.issues = vec![e.to_string()];
                        schema_failed = true;
                    }
                }
            }
            report
                .per_agent
                .insert(response.agent_name.clone(), validation);
        }

        // Phase B: cross-agent consistency, only meaningful with more than
        // one successful response.
        let succeeded: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();
        if succeeded.len() > 1 {
            report.consistency_issues = consistency_issues(plan, &succeeded);
        } else if let Some(only) = succeeded.first() {
            // The operation-echo rule still applies to a single agent.
            if let Some(issue) = operation_mismatch(plan, only) {
                report.consistency_issues.push(issue);
            }
        }

        // Phase C: hallucination heuristics.
        let rule_hallucination = self.rule_hallucination(query, plan, &succeeded, &mut report);
        let model_hallucination = if self.config.enable_model_assisted {
            self.model_hallucination(query, &succeeded).await
        } else {
            false
        };
        report.hallucination_detected = rule_hallucination || model_hallucination;

        // Scoring.
        let mut score = 1.0;
        if schema_failed {
            score -= SCHEMA_FAIL_PENALTY;
        }
        if !report.consistency_issues.is_empty() {
            score -= CONSISTENCY_PENALTY;
        }
        if rule_hallucination {
            score -= RULE_HALLUCINATION_PENALTY;
        }
        if model_hallucination {
            score -= MODEL_HALLUCINATION_PENALTY;
        }
        report.confidence_score = score.clamp(0.0, 1.0);
        report.is_valid =
            report.confidence_score >= self.config.confidence_threshold && !schema_failed;
        report
    }

    /// Deterministic hallucination rules. Appends explanations to
    /// `overall_issues` and returns whether anything fired.
    fn rule_hallucination(
        &self,
        query: &str,
        plan: &SelectionPlan,
        succeeded: &[&AgentResponse],
        report: &mut ValidationReport,
    ) -> bool {
        let mut detected = false;
        for response in succeeded {
            let capabilities = self
                .registry
                .lookup(&response.agent_name)
                .map(|d| d.capabilities)
                .unwrap_or_default();

            if capabilities.iter().any(|c| {
                matches!(c.as_str(), "math" | "arithmetic" | "calculation" | "calculator")
            }) && impossible_math(&response.data)
            {
                report.overall_issues.push(format!(
                    "agent '{}' claims success with a non-finite numeric result",
                    response.agent_name
                ));
                detected = true;
            }

            if capabilities
                .iter()
                .any(|c| matches!(c.as_str(), "search" | "web" | "lookup"))
                && no_keyword_overlap(query, &response.data)
            {
                report.overall_issues.push(format!(
                    "agent '{}' response shares no terms with the query",
                    response.agent_name
                ));
                detected = true;
            }

            if let Some(issue) = operation_mismatch(plan, response) {
                report.overall_issues.push(issue);
                detected = true;
            }
        }
        detected
    }

    /// Model-assisted relevance check. A soft signal: it only ever lowers
    /// the score, never decides validity on its own.
    async fn model_hallucination(&self, query: &str, succeeded: &[&AgentResponse]) -> bool {
        for response in succeeded {
            if let Some(judgment) = self
                .reasoning
                .assess_relevance(query, &response.agent_name, &response.data)
                .await
            {
                if !judgment.relevant && judgment.confidence >= 0.5 {
                    return true;
                }
            }
        }
        false
    }
}

fn consistency_issues(plan: &SelectionPlan, succeeded: &[&AgentResponse]) -> Vec<String> {
    let mut issues = Vec::new();

    // A downstream agent must not report more outputs than its upstream
    // produced.
    let mut upstream_count: Option<(String, u64)> = None;
    for response in succeeded {
        if let Some(output_count) = response.data.get("output_count").and_then(|v| v.as_u64()) {
            if let Some((ref upstream, count)) = upstream_count {
                if output_count > count {
                    issues.push(format!(
                        "agent '{}' reports output_count={} but upstream '{}' produced count={}",
                        response.agent_name, output_count, upstream, count
                    ));
                }
            }
        }
        if let Some(count) = response.data.get("count").and_then(|v| v.as_u64()) {
            upstream_count = Some((response.agent_name.clone(), count));
        }
    }

    for response in succeeded {
        if let Some(issue) = operation_mismatch(plan, response) {
            issues.push(issue);
        }
        if let Some(field) = non_finite_field(&response.data) {
            issues.push(format!(
                "agent '{}' field '{}' is not a finite number",
                response.agent_name, field
            ));
        }
    }
    issues
}

/// The agent echoed an `operation` that disagrees with the plan's extracted
/// parameter.
fn operation_mismatch(plan: &SelectionPlan, response: &AgentResponse) -> Option<String> {
    let requested = plan
        .parameters
        .get(&response.agent_name)?
        .get("operation")?
        .as_str()?;
    let echoed = response.data.get("operation")?.as_str()?;
    if requested != echoed {
        Some(format!(
            "agent '{}' echoed operation '{}' but the plan requested '{}'",
            response.agent_name, echoed, requested
        ))
    } else {
        None
    }
}

/// Math output that cannot be real: a null or textual NaN/Infinity result.
fn impossible_math(data: &serde_json::Value) -> bool {
    match data.get("result") {
        Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(s)) => {
            matches!(s.as_str(), "NaN" | "Infinity" | "-Infinity" | "inf" | "-inf")
        }
        Some(serde_json::Value::Number(n)) => !n.as_f64().map_or(true, f64::is_finite),
        _ => false,
    }
}

fn non_finite_field(data: &serde_json::Value) -> Option<String> {
    if let serde_json::Value::Object(map) = data {
        for (key, value) in map {
            if let Some(n) = value.as_f64() {
                if !n.is_finite() {
                    return Some(key.clone());
                }
            }
        }
    }
    None
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "how", "who", "when", "where", "about", "from", "that",
    "this", "please", "search", "find", "look",
];

/// True when the serialized response shares zero content words with the
/// query despite the agent claiming success.
fn no_keyword_overlap(query: &str, data: &serde_json::Value) -> bool {
    let keywords: HashSet<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect();
    if keywords.is_empty() {
        return false;
    }
    let haystack = data.to_string().to_lowercase();
    !keywords.iter().any(|kw| haystack.contains(kw))
}
