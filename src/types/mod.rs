//! Core data model for the orchestrator.
//!
//! These are the records that flow through the request pipeline: agent
//! descriptors, selection plans, policy evaluations, per-invocation
//! responses, and validation reports. Wire payloads stay `serde_json::Value`
//! at the boundary; everything the pipeline reasons about is typed here.

pub mod error;

pub use error::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a single orchestrated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_true() -> bool {
    true
}

/// Operational guardrails attached to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRole {
    /// Operations this agent may perform. Empty means unrestricted.
    #[serde(default)]
    pub allowed_operations: HashSet<String>,
    /// Operations this agent must never perform.
    #[serde(default)]
    pub denied_operations: HashSet<String>,
    /// Hard ceiling on a single execution.
    #[serde(default, with = "humantime_serde::option")]
    pub max_execution_time: Option<Duration>,
    /// Whether a human approval step is required before execution.
    #[serde(default)]
    pub require_approval: bool,
    /// Free-form guardrail settings consumed by agent implementations.
    #[serde(default)]
    pub guardrails: HashMap<String, serde_json::Value>,
}

/// Per-agent execution constraints. All fields optional; defaults come from
/// the orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConstraints {
    /// Override for the retry budget (attempts = max_retries + 1).
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Override for the per-call timeout.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Requests allowed per tumbling minute. `None` means unlimited.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// If set, only these top-level input fields reach the agent.
    #[serde(default)]
    pub allowed_input_fields: Option<HashSet<String>>,
    /// Top-level input fields stripped before dispatch.
    #[serde(default)]
    pub denied_input_fields: HashSet<String>,
    /// Whether agent output should be sanitized before validation.
    #[serde(default)]
    pub sanitize_output: bool,
}

/// Immutable description of a registered agent. Created at startup from
/// configuration or dynamically through the registry API; never mutated
/// after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique, non-empty identifier.
    pub name: String,
    /// Non-empty set of capability tags. Lowercased at registration.
    pub capabilities: Vec<String>,
    /// Free text fed to the reasoning client when selecting agents.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: AgentRole,
    #[serde(default)]
    pub constraints: AgentConstraints,
    /// Name of another registered agent to try when retries are exhausted.
    #[serde(default)]
    pub fallback_name: Option<String>,
    /// Key into the output-schema catalogue.
    #[serde(default)]
    pub output_schema_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Circuit breaker state, as exposed in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of an agent's health counters.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealthSnapshot {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_execution_time_ms: f64,
    /// Computed from circuit state: healthy iff the circuit is not open.
    pub is_healthy: bool,
    pub circuit_state: CircuitState,
    /// When an open circuit will admit its next probe.
    pub open_until: Option<DateTime<Utc>>,
}

/// How a selection plan was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    Rule,
    RuleValidated,
    RuleMultiValidated,
    AiOverride,
    Ai,
    Hybrid,
    None,
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionMethod::Rule => "rule",
            SelectionMethod::RuleValidated => "rule_validated",
            SelectionMethod::RuleMultiValidated => "rule_multi_validated",
            SelectionMethod::AiOverride => "ai_override",
            SelectionMethod::Ai => "ai",
            SelectionMethod::Hybrid => "hybrid",
            SelectionMethod::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Per-agent parameter overrides: agent name → param name → value.
pub type PlanParameters = HashMap<String, serde_json::Map<String, serde_json::Value>>;

/// The final choice of which agents to run, in what mode, with what
/// per-agent input overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionPlan {
    /// Ordered, non-empty list of registered, enabled, healthy agent names
    /// (empty only when `method` is `none`).
    pub agents: Vec<String>,
    /// If true the agents are independent and may run concurrently.
    pub parallel: bool,
    pub confidence: f64,
    pub method: SelectionMethod,
    /// Short human-readable explanation of the decision.
    pub reasoning: String,
    #[serde(default)]
    pub parameters: PlanParameters,
}

impl SelectionPlan {
    /// The "no suitable agent" plan.
    pub fn none(reasoning: impl Into<String>) -> Self {
        Self {
            agents: Vec::new(),
            parallel: false,
            confidence: 0.0,
            method: SelectionMethod::None,
            reasoning: reasoning.into(),
            parameters: PlanParameters::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.method == SelectionMethod::None || self.agents.is_empty()
    }
}

/// Closed set of action categories used for policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    AddressChange,
    PaymentMethodChange,
    PasswordChange,
    CardOrder,
    HighValueTransaction,
    Transfer,
    Purchase,
    AccountClosure,
    Query,
    Other,
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionCategory::AddressChange => "address_change",
            ActionCategory::PaymentMethodChange => "payment_method_change",
            ActionCategory::PasswordChange => "password_change",
            ActionCategory::CardOrder => "card_order",
            ActionCategory::HighValueTransaction => "high_value_transaction",
            ActionCategory::Transfer => "transfer",
            ActionCategory::Purchase => "purchase",
            ActionCategory::AccountClosure => "account_closure",
            ActionCategory::Query => "query",
            ActionCategory::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// A recorded user action. Append-only; recorded only after a
/// fully-successful, non-denied, executed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAction {
    pub user_id: String,
    pub category: ActionCategory,
    pub timestamp: DateTime<Utc>,
    pub agent_names: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub allowed: bool,
    /// User-facing denial reason. Present iff `allowed` is false.
    pub reason: Option<String>,
    /// Absolute time at which a timed restriction lifts.
    pub restriction_lift_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EvaluationResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            restriction_lift_time: None,
            metadata: HashMap::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            restriction_lift_time: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_lift_time(mut self, lift: DateTime<Utc>) -> Self {
        self.restriction_lift_time = Some(lift);
        self
    }
}

/// Result of a single agent invocation, including retries and fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_name: String,
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub attempt_count: u32,
    pub fallback_used: bool,
}

/// Per-agent validation outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentValidation {
    pub schema_pass: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Overall validation report for a request.
///
/// `confidence_score` is internal only: it appears in the query log but
/// must never be serialized into a client-facing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub confidence_score: f64,
    pub hallucination_detected: bool,
    #[serde(default)]
    pub per_agent: HashMap<String, AgentValidation>,
    #[serde(default)]
    pub consistency_issues: Vec<String>,
    #[serde(default)]
    pub overall_issues: Vec<String>,
}

impl ValidationReport {
    /// A report that accepts everything; used when no agents produced output
    /// to validate.
    pub fn accept_all() -> Self {
        Self {
            is_valid: true,
            confidence_score: 1.0,
            hallucination_detected: false,
            per_agent: HashMap::new(),
            consistency_issues: Vec::new(),
            overall_issues: Vec::new(),
        }
    }
}

/// Parsed `/v1/query` request body. Unknown top-level keys are collected
/// into `fields` and become part of the base agent input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl QueryRequest {
    /// Resolved user id: explicit `user_id`, else the session, else
    /// "anonymous".
    pub fn resolved_user_id(&self) -> String {
        if let Some(ref uid) = self.user_id {
            if !uid.is_empty() {
                return uid.clone();
            }
        }
        if let Some(ref sid) = self.session_id {
            if !sid.is_empty() {
                return format!("session:{}", sid);
            }
        }
        "anonymous".to_string()
    }

    /// The base input delivered to agents: `query` plus every free-form
    /// operation field.
    pub fn base_input(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut input = self.fields.clone();
        input.insert(
            "query".to_string(),
            serde_json::Value::String(self.query.clone()),
        );
        input
    }

    /// Metadata visible to policy evaluators: free-form fields overlaid
    /// with the explicit `metadata` object.
    pub fn evaluation_metadata(&self) -> HashMap<String, serde_json::Value> {
        let mut meta: HashMap<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &self.metadata {
            meta.insert(k.clone(), v.clone());
        }
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_resolved_user_id_precedence() {
        let mut req = QueryRequest {
            query: "hello".into(),
            ..Default::default()
        };
        assert_eq!(req.resolved_user_id(), "anonymous");

        req.session_id = Some("s1".into());
        assert_eq!(req.resolved_user_id(), "session:s1");

        req.user_id = Some("u1".into());
        assert_eq!(req.resolved_user_id(), "u1");
    }

    #[test]
    fn test_base_input_includes_free_form_fields() {
        let body = serde_json::json!({
            "query": "calculate 15 + 27",
            "operation": "add",
            "operands": [15, 27]
        });
        let req: QueryRequest = serde_json::from_value(body).unwrap();
        let input = req.base_input();
        assert_eq!(input["query"], "calculate 15 + 27");
        assert_eq!(input["operation"], "add");
        assert_eq!(input["operands"], serde_json::json!([15, 27]));
    }

    #[test]
    fn test_evaluation_metadata_merges_fields() {
        let body = serde_json::json!({
            "query": "transfer 15000",
            "amount": 15000,
            "metadata": {"channel": "web"}
        });
        let req: QueryRequest = serde_json::from_value(body).unwrap();
        let meta = req.evaluation_metadata();
        assert_eq!(meta["amount"], serde_json::json!(15000));
        assert_eq!(meta["channel"], serde_json::json!("web"));
    }

    #[test]
    fn test_selection_plan_none() {
        let plan = SelectionPlan::none("nothing matched");
        assert!(plan.is_none());
        assert_eq!(plan.method, SelectionMethod::None);
        assert!(plan.agents.is_empty());
    }

    #[test]
    fn test_method_display_matches_wire_names() {
        assert_eq!(SelectionMethod::RuleMultiValidated.to_string(), "rule_multi_validated");
        assert_eq!(SelectionMethod::AiOverride.to_string(), "ai_override");
        assert_eq!(SelectionMethod::None.to_string(), "none");
    }

    #[test]
    fn test_category_display_round_trip() {
        for cat in [
            ActionCategory::AddressChange,
            ActionCategory::HighValueTransaction,
            ActionCategory::Other,
        ] {
            let s = serde_json::to_string(&cat).unwrap();
            assert_eq!(s, format!("\"{}\"", cat));
        }
    }
}
