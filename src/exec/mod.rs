//! Execution engine: drives the selected agents with retry, fallback,
//! circuit breaking, timeouts, and cancellation.
//!
//! Sequential plans run in plan order and a failed agent never aborts the
//! rest; parallel plans fan out under a global concurrency cap and results
//! are re-assembled in plan order. Each agent receives the base input merged
//! with its per-agent parameter overrides, filtered through the agent's
//! allowed/denied field constraints.

pub mod circuit;
pub mod retry;

use crate::registry::{CapabilityRegistry, InvocationContext};
use crate::types::{AgentError, AgentResponse, SelectionPlan};
use circuit::CircuitBreakerConfig;
use retry::{retry_with_backoff, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Execution tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Per-attempt timeout when the descriptor specifies none.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

fn default_max_parallel_agents() -> usize {
    4
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            default_timeout: default_timeout(),
            retry: RetryConfig::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    config: ExecutionConfig,
    fanout: Arc<Semaphore>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, config: ExecutionConfig) -> Self {
        let fanout = Arc::new(Semaphore::new(config.max_parallel_agents.max(1)));
        Self {
            registry,
            config,
            fanout,
        }
    }

    /// Execute the plan and return responses in plan order. A fallback
    /// invocation contributes its own response right after its primary's.
    pub async fn execute(
        &self,
        ctx: &InvocationContext,
        plan: &SelectionPlan,
        base_input: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<AgentResponse> {
        if plan.parallel && plan.agents.len() > 1 {
            self.execute_parallel(ctx, plan, base_input).await
        } else {
            self.execute_sequential(ctx, plan, base_input).await
        }
    }

    async fn execute_sequential(
        &self,
        ctx: &InvocationContext,
        plan: &SelectionPlan,
        base_input: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<AgentResponse> {
        let mut responses = Vec::with_capacity(plan.agents.len());
        for agent_name in &plan.agents {
            if ctx.cancel.is_cancelled() {
                responses.push(cancelled_response(agent_name));
                continue;
            }
            let input = self.agent_input(agent_name, plan, base_input);
            responses.extend(self.invoke_with_fallback(ctx, agent_name, input).await);
        }
        responses
    }

    async fn execute_parallel(
        &self,
        ctx: &InvocationContext,
        plan: &SelectionPlan,
        base_input: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<AgentResponse> {
        let mut tasks = JoinSet::new();
        for (index, agent_name) in plan.agents.iter().enumerate() {
            let engine = self.clone_for_task();
            let ctx = ctx.clone();
            let agent_name = agent_name.clone();
            let input = self.agent_input(&agent_name, plan, base_input);
            let fanout = self.fanout.clone();
            tasks.spawn(async move {
                // Closed only on engine drop; treat as cancellation.
                let _permit = match fanout.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, vec![cancelled_response(&agent_name)]),
                };
                (index, engine.invoke_with_fallback(&ctx, &agent_name, input).await)
            });
        }

        let mut slots: Vec<Option<Vec<AgentResponse>>> = vec![None; plan.agents.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, responses)) => slots[index] = Some(responses),
                Err(e) => tracing::error!(error = %e, "agent task panicked"),
            }
        }
        slots
            .into_iter()
            .enumerate()
            .flat_map(|(i, slot)| {
                slot.unwrap_or_else(|| vec![cancelled_response(&plan.agents[i])])
            })
            .collect()
    }

    fn clone_for_task(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            config: self.config.clone(),
            fanout: self.fanout.clone(),
        }
    }

    /// Merge the base input with the plan's per-agent parameters, the
    /// per-agent value winning key conflicts, then apply the agent's
    /// allowed/denied input-field constraints to the merged result. The
    /// filters run post-merge so an extracted parameter can never smuggle
    /// in a field the constraints exclude.
    pub(crate) fn agent_input(
        &self,
        agent_name: &str,
        plan: &SelectionPlan,
        base_input: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Value {
        let mut input = base_input.clone();
        if let Some(overrides) = plan.parameters.get(agent_name) {
            for (k, v) in overrides {
                input.insert(k.clone(), v.clone());
            }
        }
        if let Ok(descriptor) = self.registry.lookup(agent_name) {
            if let Some(ref allowed) = descriptor.constraints.allowed_input_fields {
                input.retain(|k, _| allowed.contains(k));
            }
            for field in &descriptor.constraints.denied_input_fields {
                input.remove(field);
            }
        }
        serde_json::Value::Object(input)
    }

    /// Invoke one agent through retry and circuit breaking; on exhaustion,
    /// dispatch the identical input to the configured fallback agent.
    async fn invoke_with_fallback(
        &self,
        ctx: &InvocationContext,
        agent_name: &str,
        input: serde_json::Value,
    ) -> Vec<AgentResponse> {
        let primary = self.invoke_one(ctx, agent_name, &input, false).await;
        if primary.success {
            return vec![primary];
        }

        let fallback_name = self
            .registry
            .lookup(agent_name)
            .ok()
            .and_then(|d| d.fallback_name);
        let fallback_name = match fallback_name {
            Some(name) if name != agent_name && self.registry.is_selectable(&name) => name,
            _ => return vec![primary],
        };

        tracing::info!(
            agent = agent_name,
            fallback = %fallback_name,
            "primary exhausted, dispatching fallback"
        );
        let fallback = self.invoke_one(ctx, &fallback_name, &input, true).await;
        vec![primary, fallback]
    }

    async fn invoke_one(
        &self,
        ctx: &InvocationContext,
        agent_name: &str,
        input: &serde_json::Value,
        fallback_used: bool,
    ) -> AgentResponse {
        let started = Instant::now();

        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if let Err(e) = self.registry.check_rate_limit(agent_name, now_unix) {
            return failed_response(agent_name, &e, 1, fallback_used, started);
        }

        let descriptor = match self.registry.lookup(agent_name) {
            Ok(d) => d,
            Err(e) => {
                return failed_response(
                    agent_name,
                    &AgentError::Failed(e.to_string()),
                    0,
                    fallback_used,
                    started,
                )
            }
        };
        let agent = match self.registry.agent_impl(agent_name) {
            Ok(a) => a,
            Err(e) => {
                return failed_response(
                    agent_name,
                    &AgentError::Failed(e.to_string()),
                    0,
                    fallback_used,
                    started,
                )
            }
        };

        let timeout = descriptor
            .constraints
            .timeout
            .or(descriptor.role.max_execution_time)
            .unwrap_or(self.config.default_timeout);
        let retry = match descriptor.constraints.max_retries {
            Some(max_retries) => self.config.retry.with_max_retries(max_retries),
            None => self.config.retry.clone(),
        };

        let registry = &self.registry;
        let outcome = retry_with_backoff(&retry, agent_name, |_attempt| {
            let agent = agent.clone();
            let input = input.clone();
            let ctx = ctx.clone();
            async move {
                registry.acquire_circuit(agent_name)?;
                let attempt_started = Instant::now();
                let result = tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
                    invoked = tokio::time::timeout(timeout, agent.invoke(&ctx, &input)) => {
                        match invoked {
                            Ok(result) => result,
                            Err(_) => Err(AgentError::Timeout(timeout)),
                        }
                    }
                };
                registry.record_outcome(agent_name, result.is_ok(), attempt_started.elapsed());
                result
            }
        })
        .await;

        match outcome.result {
            Ok(mut data) => {
                if descriptor.constraints.sanitize_output {
                    sanitize_value(&mut data);
                }
                AgentResponse {
                    agent_name: agent_name.to_string(),
                    success: true,
                    data,
                    error: None,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    attempt_count: outcome.attempts,
                    fallback_used,
                }
            }
            Err(e) => failed_response(agent_name, &e, outcome.attempts, fallback_used, started),
        }
    }
}

fn failed_response(
    agent_name: &str,
    error: &AgentError,
    attempts: u32,
    fallback_used: bool,
    started: Instant,
) -> AgentResponse {
    AgentResponse {
        agent_name: agent_name.to_string(),
        success: false,
        data: serde_json::Value::Null,
        error: Some(error.to_string()),
        execution_time_ms: started.elapsed().as_millis() as u64,
        attempt_count: attempts,
        fallback_used,
    }
}

fn cancelled_response(agent_name: &str) -> AgentResponse {
    AgentResponse {
        agent_name: agent_name.to_string(),
        success: false,
        data: serde_json::Value::Null,
        error: Some(AgentError::Cancelled.to_string()),
        execution_time_ms: 0,
        attempt_count: 0,
        fallback_used: false,
    }
}

/// Strip ASCII control characters from every string in the value.
fn sanitize_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if s.chars().any(|c| c.is_ascii_control()) {
                *s = s.chars().filter(|c| !c.is_ascii_control()).collect();
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(sanitize_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::descriptor;
    use crate::registry::{Agent, InvocationContext};
    use crate::types::{RequestId, SelectionMethod};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Agent that fails a configured number of times before succeeding.
    struct FlakyAgent {
        name: String,
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            _ctx: &InvocationContext,
            input: &serde_json::Value,
        ) -> Result<serde_json::Value, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(AgentError::Retryable("transient".into()))
            } else {
                Ok(serde_json::json!({"echo": input.clone()}))
            }
        }
    }

    fn engine_with(
        agents: Vec<(crate::types::AgentDescriptor, Arc<dyn Agent>)>,
    ) -> (ExecutionEngine, Arc<CapabilityRegistry>) {
        let registry = Arc::new(CapabilityRegistry::new(CircuitBreakerConfig::default()));
        for (desc, agent) in agents {
            registry.register(desc, agent).unwrap();
        }
        let config = ExecutionConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                exponential_base: 2.0,
            },
            ..Default::default()
        };
        (ExecutionEngine::new(registry.clone(), config), registry)
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new(RequestId::new(), CancellationToken::new())
    }

    fn plan(agents: &[&str], parallel: bool) -> SelectionPlan {
        SelectionPlan {
            agents: agents.iter().map(|a| a.to_string()).collect(),
            parallel,
            confidence: 0.9,
            method: SelectionMethod::Rule,
            reasoning: "test".into(),
            parameters: Default::default(),
        }
    }

    fn base_input(json: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        json.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let flaky: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "flaky".into(),
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        });
        let (engine, _) = engine_with(vec![(descriptor("flaky", &["math"]), flaky)]);

        let responses = engine
            .execute(&ctx(), &plan(&["flaky"], false), &base_input(serde_json::json!({"q": 1})))
            .await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].success);
        assert_eq!(responses[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_max_attempts() {
        let hopeless: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "hopeless".into(),
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (engine, _) = engine_with(vec![(descriptor("hopeless", &["math"]), hopeless)]);

        let responses = engine
            .execute(&ctx(), &plan(&["hopeless"], false), &base_input(serde_json::json!({})))
            .await;
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].success);
        // max_retries = 2, so exactly 3 attempts.
        assert_eq!(responses[0].attempt_count, 3);
        assert!(responses[0].error.is_some());
    }

    #[tokio::test]
    async fn test_fallback_dispatched_with_identical_input() {
        let hopeless: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "mcp_calc".into(),
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let backup: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "calculator".into(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let mut primary_desc = descriptor("mcp_calc", &["math"]);
        primary_desc.fallback_name = Some("calculator".into());
        let (engine, _) = engine_with(vec![
            (primary_desc, hopeless),
            (descriptor("calculator", &["math"]), backup),
        ]);

        let mut p = plan(&["mcp_calc"], false);
        p.parameters.insert(
            "mcp_calc".into(),
            serde_json::json!({"operation": "add"}).as_object().unwrap().clone(),
        );
        let responses = engine
            .execute(&ctx(), &p, &base_input(serde_json::json!({"operands": [1, 2]})))
            .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].agent_name, "mcp_calc");
        assert!(!responses[0].success);
        assert!(!responses[0].fallback_used);

        assert_eq!(responses[1].agent_name, "calculator");
        assert!(responses[1].success);
        assert!(responses[1].fallback_used);
        // The fallback received the identical post-extraction input.
        assert_eq!(responses[1].data["echo"]["operation"], "add");
        assert_eq!(responses[1].data["echo"]["operands"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_sequential_failure_does_not_abort_rest() {
        let broken: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "broken".into(),
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let fine: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "fine".into(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let (engine, _) = engine_with(vec![
            (descriptor("broken", &["a"]), broken),
            (descriptor("fine", &["b"]), fine),
        ]);

        let responses = engine
            .execute(&ctx(), &plan(&["broken", "fine"], false), &base_input(serde_json::json!({})))
            .await;
        assert_eq!(responses.len(), 2);
        assert!(!responses[0].success);
        assert!(responses[1].success);
    }

    #[tokio::test]
    async fn test_parallel_results_in_plan_order() {
        struct SlowAgent {
            name: String,
            delay: Duration,
        }
        #[async_trait]
        impl Agent for SlowAgent {
            fn name(&self) -> &str {
                &self.name
            }
            async fn invoke(
                &self,
                _ctx: &InvocationContext,
                _input: &serde_json::Value,
            ) -> Result<serde_json::Value, AgentError> {
                tokio::time::sleep(self.delay).await;
                Ok(serde_json::json!({"agent": self.name.clone()}))
            }
        }

        let slow: Arc<dyn Agent> = Arc::new(SlowAgent {
            name: "slow".into(),
            delay: Duration::from_millis(50),
        });
        let fast: Arc<dyn Agent> = Arc::new(SlowAgent {
            name: "fast".into(),
            delay: Duration::from_millis(1),
        });
        let (engine, _) = engine_with(vec![
            (descriptor("slow", &["a"]), slow),
            (descriptor("fast", &["b"]), fast),
        ]);

        let responses = engine
            .execute(&ctx(), &plan(&["slow", "fast"], true), &base_input(serde_json::json!({})))
            .await;
        let names: Vec<_> = responses.iter().map(|r| r.agent_name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast"]);
        assert!(responses.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_per_agent_parameters_override_base_input() {
        let echo: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "calculator".into(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let (engine, _) = engine_with(vec![(descriptor("calculator", &["math"]), echo)]);

        let mut p = plan(&["calculator"], false);
        p.parameters.insert(
            "calculator".into(),
            serde_json::json!({"operation": "add", "operands": [25, 75]})
                .as_object()
                .unwrap()
                .clone(),
        );
        let responses = engine
            .execute(
                &ctx(),
                &p,
                &base_input(serde_json::json!({"operation": "multiply", "query": "calc"})),
            )
            .await;
        // Extracted parameter wins over the top-level request value.
        assert_eq!(responses[0].data["echo"]["operation"], "add");
        assert_eq!(responses[0].data["echo"]["operands"], serde_json::json!([25, 75]));
        assert_eq!(responses[0].data["echo"]["query"], "calc");
    }

    #[tokio::test]
    async fn test_denied_input_fields_stripped() {
        let echo: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "restricted".into(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let mut desc = descriptor("restricted", &["x"]);
        desc.constraints.denied_input_fields = ["ssn".to_string()].into_iter().collect();
        let (engine, _) = engine_with(vec![(desc, echo)]);

        let responses = engine
            .execute(
                &ctx(),
                &plan(&["restricted"], false),
                &base_input(serde_json::json!({"query": "x", "ssn": "123-45-6789"})),
            )
            .await;
        assert!(responses[0].data["echo"].get("ssn").is_none());
        assert_eq!(responses[0].data["echo"]["query"], "x");
    }

    #[tokio::test]
    async fn test_field_constraints_filter_plan_parameters() {
        let echo: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "restricted".into(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let mut desc = descriptor("restricted", &["x"]);
        desc.constraints.allowed_input_fields = Some(
            ["query".to_string(), "operation".to_string(), "ssn".to_string()]
                .into_iter()
                .collect(),
        );
        desc.constraints.denied_input_fields = ["ssn".to_string()].into_iter().collect();
        let (engine, _) = engine_with(vec![(desc, echo)]);

        // Extracted parameters carry a denied field and a field outside the
        // allowlist; both must be stripped from the delivered input.
        let mut p = plan(&["restricted"], false);
        p.parameters.insert(
            "restricted".into(),
            serde_json::json!({"operation": "add", "ssn": "123-45-6789", "extra": true})
                .as_object()
                .unwrap()
                .clone(),
        );
        let responses = engine
            .execute(&ctx(), &p, &base_input(serde_json::json!({"query": "x"})))
            .await;

        let delivered = &responses[0].data["echo"];
        assert_eq!(delivered["operation"], "add");
        assert_eq!(delivered["query"], "x");
        assert!(delivered.get("ssn").is_none());
        assert!(delivered.get("extra").is_none());
    }

    #[tokio::test]
    async fn test_cancellation_reaches_agents() {
        struct HangingAgent;
        #[async_trait]
        impl Agent for HangingAgent {
            fn name(&self) -> &str {
                "hanging"
            }
            async fn invoke(
                &self,
                ctx: &InvocationContext,
                _input: &serde_json::Value,
            ) -> Result<serde_json::Value, AgentError> {
                ctx.cancel.cancelled().await;
                Err(AgentError::Cancelled)
            }
        }

        let (engine, _) = engine_with(vec![(
            descriptor("hanging", &["x"]),
            Arc::new(HangingAgent) as Arc<dyn Agent>,
        )]);

        let cancel = CancellationToken::new();
        let ctx = InvocationContext::new(RequestId::new(), cancel.clone());
        let handle = tokio::spawn(async move {
            engine
                .execute(&ctx, &plan(&["hanging"], false), &base_input(serde_json::json!({})))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let responses = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation must propagate within a bounded time")
            .unwrap();
        assert!(!responses[0].success);
        assert!(responses[0].error.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_rate_limited_agent_fails_fast() {
        let echo: Arc<dyn Agent> = Arc::new(FlakyAgent {
            name: "limited".into(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let mut desc = descriptor("limited", &["x"]);
        desc.constraints.rate_limit_per_minute = Some(1);
        let (engine, _) = engine_with(vec![(desc, echo)]);

        let input = base_input(serde_json::json!({}));
        let first = engine.execute(&ctx(), &plan(&["limited"], false), &input).await;
        assert!(first[0].success);

        let second = engine.execute(&ctx(), &plan(&["limited"], false), &input).await;
        assert!(!second[0].success);
        assert!(second[0].error.as_deref().unwrap().contains("rate limit"));
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        let mut value = serde_json::json!({
            "text": "clean\u{0007}me",
            "nested": ["a\u{0000}b"]
        });
        sanitize_value(&mut value);
        assert_eq!(value["text"], "cleanme");
        assert_eq!(value["nested"][0], "ab");
    }
}
