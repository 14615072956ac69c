//! End-to-end pipeline scenarios driven through the full orchestrator with
//! mock agents and a scripted reasoning provider.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use conductor::audit::QueryLogRecord;
use conductor::config::ConfigBundle;
use conductor::policy::evaluators::{EvaluatorEntry, EvaluatorSpec};
use conductor::reasoning::TextGenerator;
use conductor::routing::rules::{Rule, RuleCondition};
use conductor::types::{
    ActionCategory, AgentConstraints, AgentDescriptor, AgentError, QueryRequest, ReasoningError,
    UserAction,
};
use conductor::{Agent, InvocationContext, Orchestrator, PipelineResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Arithmetic agent: computes from `operation` and `operands`.
struct CalculatorAgent;

#[async_trait]
impl Agent for CalculatorAgent {
    fn name(&self) -> &str {
        "calculator"
    }

    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let operation = input
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("add");
        let operands: Vec<f64> = input
            .get("operands")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_f64()).collect())
            .unwrap_or_default();
        let result = match operation {
            "multiply" => operands.iter().product::<f64>(),
            _ => operands.iter().sum::<f64>(),
        };
        Ok(serde_json::json!({"result": result, "operation": operation}))
    }
}

/// Search agent: echoes keyword-shaped results.
struct SearchAgent;

#[async_trait]
impl Agent for SearchAgent {
    fn name(&self) -> &str {
        "search"
    }

    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let keywords: Vec<String> = input
            .get("keywords")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_else(|| vec![input.get("query").and_then(|v| v.as_str()).unwrap_or("").to_string()]);
        let results: Vec<String> = keywords.iter().map(|k| format!("result for {}", k)).collect();
        Ok(serde_json::json!({"results": results, "keywords": keywords, "count": results.len()}))
    }
}

/// Always fails with a retryable error; counts invocations.
struct FailingAgent {
    name: String,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        _input: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Retryable("upstream flaked".into()))
    }
}

/// Succeeds but counts invocations, for asserting an agent was never run.
struct CountingAgent {
    name: String,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Agent for CountingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        _input: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({"ok": true}))
    }
}

/// Replays scripted reasoning replies in order.
struct ScriptedGenerator {
    replies: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, _system: &str, _user: &str) -> Result<String, ReasoningError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(ReasoningError::Unavailable);
        }
        Ok(replies.remove(0))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn descriptor(name: &str, caps: &[&str]) -> AgentDescriptor {
    AgentDescriptor {
        name: name.to_string(),
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        description: format!("{} test agent", name),
        role: Default::default(),
        constraints: Default::default(),
        fallback_name: None,
        output_schema_name: None,
        enabled: true,
    }
}

fn keyword_rule(name: &str, confidence: f64, keywords: &[&str], agents: &[&str]) -> Rule {
    Rule {
        name: name.to_string(),
        priority: 10,
        confidence,
        conditions: vec![RuleCondition::Keyword {
            field: "query".into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }],
        target_agents: agents.iter().map(|a| a.to_string()).collect(),
    }
}

fn bundle(rules: Vec<Rule>, evaluators: Vec<EvaluatorEntry>) -> ConfigBundle {
    let mut bundle = ConfigBundle {
        orchestrator: Default::default(),
        agents: vec![],
        rules,
        evaluators,
        schema_files: HashMap::new(),
    };
    bundle.orchestrator.audit.enabled = false;
    // Keep retries fast in tests.
    bundle.orchestrator.execution.retry.initial_delay = Duration::from_millis(1);
    bundle.orchestrator.execution.retry.max_delay = Duration::from_millis(4);
    bundle
}

fn request(body: serde_json::Value) -> QueryRequest {
    serde_json::from_value(body).unwrap()
}

async fn run(orchestrator: &Orchestrator, body: serde_json::Value) -> PipelineResponse {
    orchestrator
        .process_query(request(body), CancellationToken::new(), None)
        .await
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_math_rule_path_validated() {
    let dir = tempfile::tempdir().unwrap();
    let mut bundle = bundle(
        vec![keyword_rule("math", 0.95, &["calculate"], &["calculator"])],
        vec![],
    );
    bundle.orchestrator.audit.enabled = true;
    bundle.orchestrator.audit.log_dir = dir.path().to_path_buf();

    let orchestrator = Orchestrator::builder(bundle)
        .with_text_generator(ScriptedGenerator::new(&[
            r#"{"is_valid": true, "confidence": 0.9, "reasoning": "calculator fits",
                "parameters": {"calculator": {"operation": "add", "operands": [15, 27]}}}"#,
        ]))
        .with_agent(descriptor("calculator", &["math", "arithmetic"]), Arc::new(CalculatorAgent))
        .build()
        .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "calculate 15 + 27", "operation": "add", "operands": [15, 27]}),
    )
    .await;

    assert!(response.success);
    let data = response.data.as_ref().unwrap();
    assert_eq!(data["calculator"]["result"], 42.0);
    let metadata = response.metadata.as_ref().unwrap();
    assert_eq!(metadata.reasoning.method, "rule_validated");
    assert_eq!(metadata.agent_trail, vec!["calculator".to_string()]);

    // No confidence field anywhere in the client body.
    let body = serde_json::to_string(&response).unwrap();
    assert!(!body.contains("confidence"));

    // The query log carries the internal confidence score.
    orchestrator.shutdown().await;
    let record = read_single_log(dir.path());
    assert!(record.validation.confidence_score >= 0.7);
    assert!(record.validation.is_valid);
    assert_eq!(record.outcome, "completed");
    assert_eq!(record.reasoning.selected_agents, vec!["calculator".to_string()]);
}

#[tokio::test]
async fn parallel_fan_out_with_per_agent_extraction() {
    let bundle = bundle(
        vec![
            keyword_rule("math", 0.9, &["calculate"], &["calculator"]),
            keyword_rule("web", 0.8, &["search"], &["search"]),
        ],
        vec![],
    );
    let orchestrator = Orchestrator::builder(bundle)
        .with_text_generator(ScriptedGenerator::new(&[
            r#"{"is_valid": true, "confidence": 0.9, "reasoning": "both apply",
                "parameters": {
                    "calculator": {"operation": "add", "operands": [25, 75]},
                    "search": {"keywords": ["machine learning"]}
                }}"#,
        ]))
        .with_agent(descriptor("calculator", &["math"]), Arc::new(CalculatorAgent))
        .with_agent(descriptor("search", &["search", "web"]), Arc::new(SearchAgent))
        .build()
        .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "calculate 25 + 75 and search for machine learning"}),
    )
    .await;

    assert!(response.success);
    let metadata = response.metadata.as_ref().unwrap();
    assert!(metadata.parallel);
    assert_eq!(metadata.agent_trail.len(), 2);
    assert_eq!(metadata.reasoning.method, "rule_multi_validated");

    let data = response.data.as_ref().unwrap();
    assert_eq!(data["calculator"]["result"], 100.0);
    assert_eq!(
        data["search"]["keywords"],
        serde_json::json!(["machine learning"])
    );
}

#[tokio::test]
async fn timed_restriction_denies_card_order() {
    let evaluator = EvaluatorEntry {
        name: "post-address-change-block".into(),
        enabled: true,
        spec: EvaluatorSpec::TimedRestriction {
            trigger_category: ActionCategory::AddressChange,
            blocked_categories: vec![ActionCategory::CardOrder],
            block_hours: 24,
        },
    };
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::builder(bundle(
        vec![keyword_rule("cards", 0.9, &["card"], &["card_agent"])],
        vec![evaluator],
    ))
    .without_reasoning()
    .with_agent(
        descriptor("card_agent", &["cards"]),
        Arc::new(CountingAgent {
            name: "card_agent".into(),
            calls: calls.clone(),
        }),
    )
    .build()
    .unwrap();

    // The same user changed their address two hours ago.
    orchestrator.history().record_action(UserAction {
        user_id: "u1".into(),
        category: ActionCategory::AddressChange,
        timestamp: Utc::now() - ChronoDuration::hours(2),
        agent_names: vec!["profile".into()],
        metadata: HashMap::new(),
    });

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "order a new card", "user_id": "u1"}),
    )
    .await;

    assert!(!response.success);
    let error = response.error.as_ref().unwrap();
    assert_eq!(error.kind.to_string(), "policy_denied");

    // Lift time is the trigger timestamp plus 24 hours, i.e. ~22h out.
    let lift = error.restriction_lift_time.unwrap();
    let remaining = lift - Utc::now();
    assert!(remaining > ChronoDuration::hours(21) && remaining < ChronoDuration::hours(23));

    // No agent was invoked and no new action was recorded.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let actions = orchestrator
        .history()
        .actions_since("u1", None, Utc::now() - ChronoDuration::days(7));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].category, ActionCategory::AddressChange);
}

#[tokio::test]
async fn threshold_denies_high_value_transfer() {
    let evaluator = EvaluatorEntry {
        name: "high-value".into(),
        enabled: true,
        spec: EvaluatorSpec::Threshold {
            field: "amount".into(),
            max_value: 10_000.0,
        },
    };
    let orchestrator = Orchestrator::builder(bundle(
        vec![keyword_rule("transfers", 0.9, &["transfer"], &["transfer_agent"])],
        vec![evaluator],
    ))
    .without_reasoning()
    .with_agent(
        descriptor("transfer_agent", &["payments"]),
        Arc::new(CountingAgent {
            name: "transfer_agent".into(),
            calls: Arc::new(AtomicU32::new(0)),
        }),
    )
    .build()
    .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "transfer 15000", "user_id": "u2", "amount": 15000}),
    )
    .await;

    assert!(!response.success);
    let error = response.error.as_ref().unwrap();
    assert_eq!(error.kind.to_string(), "policy_denied");
    assert!(error.message.contains("10000"));
}

#[tokio::test]
async fn low_confidence_override_returns_no_agent() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::builder(bundle(
        // A vague, low-confidence rule match forces escalation.
        vec![keyword_rule("vague", 0.4, &["address"], &["calculator"])],
        vec![],
    ))
    .with_text_generator(ScriptedGenerator::new(&[
        r#"{"is_valid": false, "confidence": 0.3, "reasoning": "maybe the planning agent",
            "suggested_agents": ["planning"]}"#,
    ]))
    .with_agent(
        descriptor("calculator", &["math"]),
        Arc::new(CountingAgent {
            name: "calculator".into(),
            calls: calls.clone(),
        }),
    )
    .build()
    .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "i want to change my address", "user_id": "u3"}),
    )
    .await;

    assert!(!response.success);
    assert_eq!(response.error.as_ref().unwrap().kind.to_string(), "no_agent");

    // method=none means nothing ran and nothing was recorded.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let actions = orchestrator
        .history()
        .actions_since("u3", None, Utc::now() - ChronoDuration::days(1));
    assert!(actions.is_empty());
}

#[tokio::test]
async fn retry_exhaustion_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut test_bundle = bundle(
        vec![keyword_rule("math", 0.9, &["calculate"], &["mcp_calc"])],
        vec![],
    );
    test_bundle.orchestrator.audit.enabled = true;
    test_bundle.orchestrator.audit.log_dir = dir.path().to_path_buf();

    let failing_calls = Arc::new(AtomicU32::new(0));
    let mut primary = descriptor("mcp_calc", &["math"]);
    primary.fallback_name = Some("calculator".into());
    primary.constraints = AgentConstraints {
        max_retries: Some(2),
        ..Default::default()
    };

    let orchestrator = Orchestrator::builder(test_bundle)
        .without_reasoning()
        .with_agent(
            primary,
            Arc::new(FailingAgent {
                name: "mcp_calc".into(),
                calls: failing_calls.clone(),
            }),
        )
        .with_agent(descriptor("calculator", &["math"]), Arc::new(CalculatorAgent))
        .build()
        .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "calculate 15 + 27", "operation": "add", "operands": [15, 27]}),
    )
    .await;

    assert!(response.success);
    let metadata = response.metadata.as_ref().unwrap();
    assert_eq!(
        metadata.agent_trail,
        vec!["mcp_calc".to_string(), "calculator".to_string()]
    );
    assert_eq!(response.data.as_ref().unwrap()["calculator"]["result"], 42.0);

    // Exactly max_retries + 1 invocation attempts were made.
    assert_eq!(failing_calls.load(Ordering::SeqCst), 3);

    orchestrator.shutdown().await;
    let record = read_single_log(dir.path());
    assert_eq!(record.agent_interactions.len(), 2);
    let primary_log = &record.agent_interactions[0];
    assert_eq!(primary_log.agent_name, "mcp_calc");
    assert!(!primary_log.success);
    assert_eq!(primary_log.attempts, 3);
    assert!(primary_log.error.is_some());
    let fallback_log = &record.agent_interactions[1];
    assert_eq!(fallback_log.agent_name, "calculator");
    assert!(fallback_log.success);
    assert!(fallback_log.fallback_used);
}

#[tokio::test]
async fn security_rejection_precedes_everything() {
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = Orchestrator::builder(bundle(
        vec![keyword_rule("math", 0.9, &["calculate"], &["calculator"])],
        vec![],
    ))
    .without_reasoning()
    .with_agent(
        descriptor("calculator", &["math"]),
        Arc::new(CountingAgent {
            name: "calculator".into(),
            calls: calls.clone(),
        }),
    )
    .build()
    .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "calculate 1; rm -rf /"}),
    )
    .await;

    assert!(!response.success);
    assert_eq!(response.error.as_ref().unwrap().kind.to_string(), "security");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn all_agents_failed_reports_agent_failed() {
    let orchestrator = Orchestrator::builder(bundle(
        vec![keyword_rule("math", 0.9, &["calculate"], &["mcp_calc"])],
        vec![],
    ))
    .without_reasoning()
    .with_agent(
        descriptor("mcp_calc", &["math"]),
        Arc::new(FailingAgent {
            name: "mcp_calc".into(),
            calls: Arc::new(AtomicU32::new(0)),
        }),
    )
    .build()
    .unwrap();

    let response = run(&orchestrator, serde_json::json!({"query": "calculate 1 + 1"})).await;
    assert!(!response.success);
    let error = response.error.as_ref().unwrap();
    assert_eq!(error.kind.to_string(), "agent_failed");
    assert!(error.message.contains("mcp_calc"));
}

#[tokio::test]
async fn streaming_and_json_agree_on_data() {
    use conductor::PipelineEvent;
    use tokio::sync::mpsc;

    let build = || {
        Orchestrator::builder(bundle(
            vec![keyword_rule("math", 0.9, &["calculate"], &["calculator"])],
            vec![],
        ))
        .without_reasoning()
        .with_agent(descriptor("calculator", &["math"]), Arc::new(CalculatorAgent))
        .build()
        .unwrap()
    };
    let body = serde_json::json!({"query": "calculate 15 + 27", "operation": "add", "operands": [15, 27]});

    // JSON mode.
    let orchestrator = build();
    let json_response = run(&orchestrator, body.clone()).await;

    // Streaming mode: collect the event sequence.
    let orchestrator = build();
    let (tx, mut rx) = mpsc::channel(32);
    let streamed = orchestrator
        .process_query(request(body), CancellationToken::new(), Some(tx))
        .await;

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name().to_string());
        if let PipelineEvent::Completed { response } = event {
            assert_eq!(
                serde_json::to_value(&response.data).unwrap(),
                serde_json::to_value(&json_response.data).unwrap()
            );
        }
    }
    assert_eq!(
        names,
        vec![
            "started",
            "security_validation",
            "reasoning_started",
            "reasoning_complete",
            "agents_executing",
            "agent_output",
            "validation",
            "completed"
        ]
    );
    assert_eq!(
        streamed.metadata.as_ref().unwrap().agent_trail,
        json_response.metadata.as_ref().unwrap().agent_trail
    );
}

#[tokio::test]
async fn partial_failure_records_no_user_action() {
    // Two confident rules fan out in parallel; one agent succeeds, the
    // other exhausts retries with no fallback. The response still carries
    // the partial data, but the request is not fully successful, so no
    // action lands in the user's history.
    let orchestrator = Orchestrator::builder(bundle(
        vec![
            keyword_rule("math", 0.9, &["calculate"], &["calculator"]),
            keyword_rule("fetch", 0.85, &["fetch"], &["fetcher"]),
        ],
        vec![],
    ))
    .without_reasoning()
    .with_agent(descriptor("calculator", &["math"]), Arc::new(CalculatorAgent))
    .with_agent(
        descriptor("fetcher", &["lookup"]),
        Arc::new(FailingAgent {
            name: "fetcher".into(),
            calls: Arc::new(AtomicU32::new(0)),
        }),
    )
    .build()
    .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({
            "query": "calculate 2 + 2 and fetch the report",
            "user_id": "u7",
            "operands": [2, 2]
        }),
    )
    .await;

    assert!(response.success);
    let metadata = response.metadata.as_ref().unwrap();
    assert!(metadata.parallel);
    assert_eq!(metadata.agent_trail.len(), 2);
    let data = response.data.as_ref().unwrap();
    assert_eq!(data["calculator"]["result"], 4.0);
    assert!(data.get("fetcher").is_none());

    let actions = orchestrator
        .history()
        .actions_since("u7", None, Utc::now() - ChronoDuration::hours(1));
    assert!(actions.is_empty());
}

#[tokio::test]
async fn successful_request_records_user_action() {
    let orchestrator = Orchestrator::builder(bundle(
        vec![keyword_rule("math", 0.9, &["calculate"], &["calculator"])],
        vec![],
    ))
    .without_reasoning()
    .with_agent(descriptor("calculator", &["math"]), Arc::new(CalculatorAgent))
    .build()
    .unwrap();

    let response = run(
        &orchestrator,
        serde_json::json!({"query": "calculate 2 + 3", "user_id": "u9", "operands": [2, 3]}),
    )
    .await;
    assert!(response.success);

    let actions = orchestrator
        .history()
        .actions_since("u9", None, Utc::now() - ChronoDuration::hours(1));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].category, ActionCategory::Query);
    assert_eq!(actions[0].agent_names, vec!["calculator".to_string()]);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_single_log(dir: &std::path::Path) -> QueryLogRecord {
    let day_dir = std::fs::read_dir(dir)
        .unwrap()
        .next()
        .expect("one day directory")
        .unwrap()
        .path();
    let file = std::fs::read_dir(&day_dir)
        .unwrap()
        .next()
        .expect("one log record")
        .unwrap()
        .path();
    serde_json::from_str(&std::fs::read_to_string(file).unwrap()).unwrap()
}
