//! The orchestrator pipeline.
//!
//! Composes every subsystem and drives a request through the ordered steps:
//! sanitize → classify → select → policy-evaluate → execute (retry,
//! fallback, circuit) → validate (with bounded re-execution) → record the
//! user action → postprocess → write the query log → respond. All state is
//! owned by the [`Orchestrator`] value; there are no globals.

use crate::audit::{
    redact, AgentInteraction, PolicyLog, QueryLogRecord, QueryLogWriter, ReasoningLog,
    RetryAttemptLog, TimingLog, ValidationLog,
};
use crate::config::{ConfigBundle, OrchestratorConfig};
use crate::exec::ExecutionEngine;
use crate::metrics::StatsCollector;
use crate::policy::{
    ActionHistory, CategoryClassifier, Evaluator, EvaluatorRegistry,
};
use crate::reasoning::provider::ChatCompletionClient;
use crate::reasoning::{ReasoningClient, TextGenerator};
use crate::registry::remote::HttpAgent;
use crate::registry::{Agent, CapabilityRegistry, InvocationContext};
use crate::routing::hybrid::{HybridReasoner, SelectionOutcome};
use crate::routing::rules::RuleEngine;
use crate::types::{
    ActionCategory, AgentDescriptor, AgentResponse, ErrorKind, OrchestratorError, QueryRequest,
    RequestId, SelectionPlan, ValidationReport,
};
use crate::validation::{ResponseValidator, SchemaCatalogue};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reasoning summary exposed to clients. Deliberately carries no
/// confidence: confidence scores never appear in client responses.
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningMeta {
    pub method: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub agent_trail: Vec<String>,
    pub parallel: bool,
    pub execution_time_ms: u64,
    pub reasoning: ReasoningMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restriction_lift_time: Option<DateTime<Utc>>,
}

/// The terminal result of a request, serialized as-is by the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub success: bool,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl PipelineResponse {
    fn failure(request_id: RequestId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            request_id,
            data: None,
            metadata: None,
            display_text: None,
            error: Some(ResponseError {
                kind,
                message: message.into(),
                restriction_lift_time: None,
            }),
        }
    }
}

/// Events emitted while a streaming request progresses. Names and order
/// follow the SSE contract.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Started {
        request_id: RequestId,
    },
    SecurityValidation {
        passed: bool,
    },
    ReasoningStarted,
    ReasoningComplete {
        method: String,
        agents: Vec<String>,
        parallel: bool,
    },
    AgentsExecuting {
        agents: Vec<String>,
    },
    AgentOutput {
        agent_name: String,
        success: bool,
        data: serde_json::Value,
        fallback_used: bool,
    },
    Validation {
        is_valid: bool,
        warning: Option<String>,
    },
    Completed {
        response: PipelineResponse,
    },
    Error {
        response: PipelineResponse,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Started { .. } => "started",
            PipelineEvent::SecurityValidation { .. } => "security_validation",
            PipelineEvent::ReasoningStarted => "reasoning_started",
            PipelineEvent::ReasoningComplete { .. } => "reasoning_complete",
            PipelineEvent::AgentsExecuting { .. } => "agents_executing",
            PipelineEvent::AgentOutput { .. } => "agent_output",
            PipelineEvent::Validation { .. } => "validation",
            PipelineEvent::Completed { .. } => "completed",
            PipelineEvent::Error { .. } => "error",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            PipelineEvent::Started { request_id } => {
                serde_json::json!({"request_id": request_id})
            }
            PipelineEvent::SecurityValidation { passed } => {
                serde_json::json!({"passed": passed})
            }
            PipelineEvent::ReasoningStarted => serde_json::json!({}),
            PipelineEvent::ReasoningComplete {
                method,
                agents,
                parallel,
            } => serde_json::json!({"method": method, "agents": agents, "parallel": parallel}),
            PipelineEvent::AgentsExecuting { agents } => {
                serde_json::json!({"agents": agents})
            }
            PipelineEvent::AgentOutput {
                agent_name,
                success,
                data,
                fallback_used,
            } => serde_json::json!({
                "agent_name": agent_name,
                "success": success,
                "data": data,
                "fallback_used": fallback_used
            }),
            PipelineEvent::Validation { is_valid, warning } => {
                serde_json::json!({"is_valid": is_valid, "warning": warning})
            }
            PipelineEvent::Completed { response } | PipelineEvent::Error { response } => {
                serde_json::to_value(response).unwrap_or_default()
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Completed { .. } | PipelineEvent::Error { .. }
        )
    }
}

type EventSink = Option<mpsc::Sender<PipelineEvent>>;

/// Presentation hook. Pure over (text, session state); it sees only the
/// display text and can never touch `data` or `metadata`.
pub trait ResponseDecorator: Send + Sync {
    fn decorate(&self, display_text: &str, session_id: Option<&str>) -> String;
}

/// Default decorator: a plain conversational frame around the summary.
pub struct ConversationalWrapper;

impl ResponseDecorator for ConversationalWrapper {
    fn decorate(&self, display_text: &str, _session_id: Option<&str>) -> String {
        format!("Here's what I found: {}", display_text)
    }
}

/// Builder wiring configuration, agent implementations, and optional
/// overrides into an [`Orchestrator`].
pub struct OrchestratorBuilder {
    bundle: ConfigBundle,
    programmatic_agents: Vec<(AgentDescriptor, Arc<dyn Agent>)>,
    agent_impls: HashMap<String, Arc<dyn Agent>>,
    custom_evaluators: HashMap<String, Arc<dyn Evaluator>>,
    generator: Option<Arc<dyn TextGenerator>>,
    reasoning_disabled: bool,
    decorator: Option<Arc<dyn ResponseDecorator>>,
}

impl OrchestratorBuilder {
    pub fn new(bundle: ConfigBundle) -> Self {
        Self {
            bundle,
            programmatic_agents: Vec::new(),
            agent_impls: HashMap::new(),
            custom_evaluators: HashMap::new(),
            generator: None,
            reasoning_disabled: false,
            decorator: None,
        }
    }

    /// Run rule-only: never construct a provider, even if the environment
    /// carries API keys.
    pub fn without_reasoning(mut self) -> Self {
        self.reasoning_disabled = true;
        self
    }

    /// Register an in-process agent with its descriptor, independent of the
    /// agents config file.
    pub fn with_agent(mut self, descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        self.programmatic_agents.push((descriptor, agent));
        self
    }

    /// Bind an implementation to an agents-config entry by name.
    pub fn with_agent_impl(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.agent_impls.insert(name.into(), agent);
        self
    }

    pub fn with_custom_evaluator(
        mut self,
        name: impl Into<String>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        self.custom_evaluators.insert(name.into(), evaluator);
        self
    }

    /// Override the text-generation provider (tests use a scripted one).
    pub fn with_text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn ResponseDecorator>) -> Self {
        self.decorator = Some(decorator);
        self
    }

    pub fn build(mut self) -> Result<Orchestrator, OrchestratorError> {
        let config = self.bundle.orchestrator.clone();

        let registry = Arc::new(CapabilityRegistry::new(config.execution.circuit.clone()));
        for entry in &self.bundle.agents {
            let name = entry.descriptor.name.clone();
            let agent: Arc<dyn Agent> = if let Some(ref endpoint) = entry.endpoint {
                let timeout = entry
                    .descriptor
                    .constraints
                    .timeout
                    .unwrap_or(config.execution.default_timeout);
                Arc::new(
                    HttpAgent::new(name.clone(), endpoint.clone(), timeout).map_err(|e| {
                        OrchestratorError::Internal(format!(
                            "remote agent '{}': {}",
                            name, e
                        ))
                    })?,
                )
            } else if let Some(agent) = self.agent_impls.remove(&name) {
                agent
            } else {
                tracing::warn!(
                    agent = %name,
                    "agents config entry has no endpoint and no bound implementation, skipping"
                );
                continue;
            };
            registry.register(entry.descriptor.clone(), agent)?;
        }
        for (descriptor, agent) in self.programmatic_agents {
            registry.register(descriptor, agent)?;
        }

        let generator = match (self.reasoning_disabled, self.generator) {
            (true, _) => None,
            (false, Some(generator)) => Some(generator),
            (false, None) => {
                ChatCompletionClient::from_env().map(|c| Arc::new(c) as Arc<dyn TextGenerator>)
            }
        };
        let reasoning_client = Arc::new(ReasoningClient::new(
            generator,
            config.reasoning.request_timeout,
        ));

        let rule_engine = RuleEngine::new(self.bundle.rules.clone())?;
        let reasoner = HybridReasoner::new(
            rule_engine,
            reasoning_client.clone(),
            registry.clone(),
            config.reasoning.hybrid.clone(),
        );

        let history = Arc::new(ActionHistory::new(config.history.clone()));
        let evaluators = EvaluatorRegistry::from_entries(
            self.bundle.evaluators.clone(),
            self.custom_evaluators,
        )?;

        let catalogue = Arc::new(SchemaCatalogue::load_from_files(
            self.bundle.schema_files.clone(),
        )?);
        let validator = ResponseValidator::new(
            catalogue,
            registry.clone(),
            reasoning_client.clone(),
            config.validation.clone(),
        );

        let engine = ExecutionEngine::new(registry.clone(), config.execution.clone());
        let audit = Arc::new(QueryLogWriter::spawn(config.audit.clone()));

        Ok(Orchestrator {
            config,
            registry,
            reasoner,
            reasoning_client,
            classifier: CategoryClassifier::new(),
            history,
            evaluators,
            engine,
            validator,
            audit,
            stats: Arc::new(StatsCollector::new()),
            decorator: self
                .decorator
                .unwrap_or_else(|| Arc::new(ConversationalWrapper)),
        })
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    reasoner: HybridReasoner,
    reasoning_client: Arc<ReasoningClient>,
    classifier: CategoryClassifier,
    history: Arc<ActionHistory>,
    evaluators: EvaluatorRegistry,
    engine: ExecutionEngine,
    validator: ResponseValidator,
    audit: Arc<QueryLogWriter>,
    stats: Arc<StatsCollector>,
    decorator: Arc<dyn ResponseDecorator>,
}

impl Orchestrator {
    pub fn builder(bundle: ConfigBundle) -> OrchestratorBuilder {
        OrchestratorBuilder::new(bundle)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn audit(&self) -> &Arc<QueryLogWriter> {
        &self.audit
    }

    pub fn history(&self) -> &Arc<ActionHistory> {
        &self.history
    }

    pub fn reasoning_provider(&self) -> Option<&str> {
        self.reasoning_client.provider_name()
    }

    /// Drain the audit queue and stop background work.
    pub async fn shutdown(&self) {
        tracing::info!("orchestrator shutting down");
        self.audit.shutdown().await;
    }

    /// Run one request through the full pipeline. `events` receives the
    /// streaming progression when the caller asked for SSE.
    pub async fn process_query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
        events: EventSink,
    ) -> PipelineResponse {
        let request_id = RequestId::new();
        let timestamp = Utc::now();
        let started = Instant::now();
        let mut phases: HashMap<String, u64> = HashMap::new();

        emit(&events, PipelineEvent::Started { request_id }).await;

        // Step 1: sanitize.
        let rejection = self.security_scan(&request);
        emit(
            &events,
            PipelineEvent::SecurityValidation {
                passed: rejection.is_none(),
            },
        )
        .await;

        // Step 2: resolve the user and classify the action.
        let user_id = request.resolved_user_id();
        let category = self.classifier.classify(&request);

        if let Some(reason) = rejection {
            tracing::warn!(%request_id, user = %user_id, reason = %reason, "request rejected");
            let response =
                PipelineResponse::failure(request_id, ErrorKind::Security, reason.clone());
            self.finish(
                FinishArgs {
                    request_id,
                    timestamp,
                    started,
                    request: &request,
                    user_id,
                    category,
                    outcome: "rejected",
                    kind: Some(ErrorKind::Security),
                    selection: None,
                    policy: None,
                    interactions: Vec::new(),
                    report: None,
                    retry_attempts: Vec::new(),
                    phases,
                },
                &response,
                &events,
            )
            .await;
            return response;
        }

        // Step 3: selection.
        emit(&events, PipelineEvent::ReasoningStarted).await;
        let phase_start = Instant::now();
        let base_input = request.base_input();
        let selection = self.reasoner.select(&base_input).await;
        phases.insert(
            "selection".into(),
            phase_start.elapsed().as_millis() as u64,
        );
        emit(
            &events,
            PipelineEvent::ReasoningComplete {
                method: selection.plan.method.to_string(),
                agents: selection.plan.agents.clone(),
                parallel: selection.plan.parallel,
            },
        )
        .await;

        if selection.plan.is_none() {
            let response = PipelineResponse::failure(
                request_id,
                ErrorKind::NoAgent,
                "We can't help with that request right now: no suitable agent is available.",
            );
            self.finish(
                FinishArgs {
                    request_id,
                    timestamp,
                    started,
                    request: &request,
                    user_id,
                    category,
                    outcome: "no_agent",
                    kind: Some(ErrorKind::NoAgent),
                    selection: Some(&selection),
                    policy: None,
                    interactions: Vec::new(),
                    report: None,
                    retry_attempts: Vec::new(),
                    phases,
                },
                &response,
                &events,
            )
            .await;
            return response;
        }

        // Step 4: policy evaluation.
        let phase_start = Instant::now();
        let evaluation_metadata = request.evaluation_metadata();
        let decision =
            self.evaluators
                .evaluate(&user_id, category, &evaluation_metadata, &self.history);
        phases.insert("policy".into(), phase_start.elapsed().as_millis() as u64);

        if !decision.result.allowed {
            if let Some(ref evaluator) = decision.denied_by {
                self.stats.record_evaluator_denial(evaluator);
            }
            let mut response = PipelineResponse::failure(
                request_id,
                ErrorKind::PolicyDenied,
                decision
                    .result
                    .reason
                    .clone()
                    .unwrap_or_else(|| "This action is not allowed right now.".into()),
            );
            if let Some(ref mut error) = response.error {
                error.restriction_lift_time = decision.result.restriction_lift_time;
            }
            self.finish(
                FinishArgs {
                    request_id,
                    timestamp,
                    started,
                    request: &request,
                    user_id,
                    category,
                    outcome: "denied",
                    kind: Some(ErrorKind::PolicyDenied),
                    selection: Some(&selection),
                    policy: Some(&decision.result),
                    interactions: Vec::new(),
                    report: None,
                    retry_attempts: Vec::new(),
                    phases,
                },
                &response,
                &events,
            )
            .await;
            return response;
        }

        // Steps 5 and 6: execute, validate, re-execute while invalid.
        let plan = &selection.plan;
        let ctx = InvocationContext::new(request_id, cancel.clone());
        emit(
            &events,
            PipelineEvent::AgentsExecuting {
                agents: plan.agents.clone(),
            },
        )
        .await;

        let mut retry_attempts: Vec<RetryAttemptLog> = Vec::new();
        let phase_start = Instant::now();
        let mut responses = self.engine.execute(&ctx, plan, &base_input).await;
        phases.insert("execution".into(), phase_start.elapsed().as_millis() as u64);

        for response in &responses {
            emit(
                &events,
                PipelineEvent::AgentOutput {
                    agent_name: response.agent_name.clone(),
                    success: response.success,
                    data: response.data.clone(),
                    fallback_used: response.fallback_used,
                },
            )
            .await;
        }

        let phase_start = Instant::now();
        let mut report = self
            .validator
            .validate(&request.query, plan, &responses)
            .await;
        let mut validation_round = 0;
        while !report.is_valid
            && validation_round < self.validator.max_retries()
            && !cancel.is_cancelled()
        {
            validation_round += 1;
            let reason = format!(
                "validation failed (score {:.2}), re-executing plan (round {})",
                report.confidence_score, validation_round
            );
            tracing::warn!(%request_id, %reason);
            retry_attempts.push(RetryAttemptLog {
                reason,
                ts: Utc::now(),
            });
            responses = self.engine.execute(&ctx, plan, &base_input).await;
            report = self
                .validator
                .validate(&request.query, plan, &responses)
                .await;
        }
        phases.insert("validation".into(), phase_start.elapsed().as_millis() as u64);

        if cancel.is_cancelled() {
            let response = PipelineResponse::failure(
                request_id,
                ErrorKind::Timeout,
                "The request was cancelled before it completed.",
            );
            self.finish(
                FinishArgs {
                    request_id,
                    timestamp,
                    started,
                    request: &request,
                    user_id,
                    category,
                    outcome: "cancelled",
                    kind: Some(ErrorKind::Timeout),
                    selection: Some(&selection),
                    policy: Some(&decision.result),
                    interactions: self.interactions(plan, &base_input, &responses),
                    report: Some(&report),
                    retry_attempts,
                    phases,
                },
                &response,
                &events,
            )
            .await;
            return response;
        }

        let validation_warning = if report.is_valid {
            None
        } else {
            Some(
                "Parts of this response did not pass automatic validation; treat the results with care."
                    .to_string(),
            )
        };
        emit(
            &events,
            PipelineEvent::Validation {
                is_valid: report.is_valid,
                warning: validation_warning.clone(),
            },
        )
        .await;

        let succeeded: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();
        if succeeded.is_empty() {
            let failed_names: Vec<&str> = responses
                .iter()
                .map(|r| r.agent_name.as_str())
                .collect();
            let response = PipelineResponse::failure(
                request_id,
                ErrorKind::AgentFailed,
                format!(
                    "All selected agents failed after retries: {}.",
                    failed_names.join(", ")
                ),
            );
            self.finish(
                FinishArgs {
                    request_id,
                    timestamp,
                    started,
                    request: &request,
                    user_id,
                    category,
                    outcome: "failed",
                    kind: Some(ErrorKind::AgentFailed),
                    selection: Some(&selection),
                    policy: Some(&decision.result),
                    interactions: self.interactions(plan, &base_input, &responses),
                    report: Some(&report),
                    retry_attempts,
                    phases,
                },
                &response,
                &events,
            )
            .await;
            return response;
        }

        // Step 7: only a fully-successful, non-denied, executed request
        // becomes part of the user's history. A failed primary counts as
        // successful when its fallback (the next response) succeeded;
        // partial success in a multi-agent plan records nothing.
        let fully_successful = responses.iter().enumerate().all(|(i, r)| {
            r.success
                || responses
                    .get(i + 1)
                    .is_some_and(|f| f.fallback_used && f.success)
        });
        if fully_successful {
            self.history.record(
                &user_id,
                category,
                responses.iter().map(|r| r.agent_name.clone()).collect(),
                evaluation_metadata,
            );
        }

        // Step 8: presentation. The decorator sees only display text.
        let summary = succeeded
            .iter()
            .map(|r| format!("{}: {}", r.agent_name, r.data))
            .collect::<Vec<_>>()
            .join("; ");
        let display_text = self
            .decorator
            .decorate(&summary, request.session_id.as_deref());

        let mut data = serde_json::Map::new();
        for response in &succeeded {
            data.insert(response.agent_name.clone(), response.data.clone());
        }
        let response = PipelineResponse {
            success: true,
            request_id,
            data: Some(data),
            metadata: Some(ResponseMetadata {
                agent_trail: responses.iter().map(|r| r.agent_name.clone()).collect(),
                parallel: plan.parallel,
                execution_time_ms: started.elapsed().as_millis() as u64,
                reasoning: ReasoningMeta {
                    method: plan.method.to_string(),
                },
                validation_warning,
            }),
            display_text: Some(display_text),
            error: None,
        };

        // Steps 9 and 10: finalize the log, then respond.
        self.finish(
            FinishArgs {
                request_id,
                timestamp,
                started,
                request: &request,
                user_id,
                category,
                outcome: "completed",
                kind: None,
                selection: Some(&selection),
                policy: Some(&decision.result),
                interactions: self.interactions(plan, &base_input, &responses),
                report: Some(&report),
                retry_attempts,
                phases,
            },
            &response,
            &events,
        )
        .await;
        response
    }

    /// Reject oversized bodies and obviously unsafe input patterns before
    /// anything downstream sees them.
    fn security_scan(&self, request: &QueryRequest) -> Option<String> {
        let size = serde_json::to_vec(request).map(|v| v.len()).unwrap_or(0);
        if size > self.config.limits.max_request_bytes {
            return Some(format!(
                "request of {} bytes exceeds the {} byte limit",
                size, self.config.limits.max_request_bytes
            ));
        }

        let mut haystacks = vec![request.query.as_str()];
        for value in request.fields.values() {
            if let Some(s) = value.as_str() {
                haystacks.push(s);
            }
        }
        for haystack in haystacks {
            for pattern in injection_signatures() {
                if pattern.is_match(haystack) {
                    return Some("input contains a disallowed pattern".into());
                }
            }
        }
        None
    }

    /// Rebuild the per-agent delivered inputs for the audit record. A
    /// fallback response received the same input as the primary before it.
    fn interactions(
        &self,
        plan: &SelectionPlan,
        base_input: &serde_json::Map<String, serde_json::Value>,
        responses: &[AgentResponse],
    ) -> Vec<AgentInteraction> {
        let mut last_primary_input = serde_json::Value::Null;
        responses
            .iter()
            .map(|response| {
                let input = if response.fallback_used {
                    last_primary_input.clone()
                } else {
                    let input = self
                        .engine
                        .agent_input(&response.agent_name, plan, base_input);
                    last_primary_input = input.clone();
                    input
                };
                AgentInteraction::from_response(response, redact(&input))
            })
            .collect()
    }

    async fn finish(
        &self,
        args: FinishArgs<'_>,
        response: &PipelineResponse,
        events: &EventSink,
    ) {
        let plan = args.selection.map(|s| &s.plan);
        let record = QueryLogRecord {
            query_id: args.request_id.0,
            timestamp: args.timestamp,
            user_query: redact(&serde_json::to_value(args.request).unwrap_or_default()),
            user_id: args.user_id,
            action_category: args.category,
            outcome: args.outcome.to_string(),
            policy: args.policy.map_or(
                PolicyLog {
                    allowed: true,
                    reason: None,
                    restriction_lift_time: None,
                },
                PolicyLog::from,
            ),
            reasoning: ReasoningLog {
                method: plan.map_or("none".to_string(), |p| p.method.to_string()),
                selected_agents: plan.map(|p| p.agents.clone()).unwrap_or_default(),
                confidence: plan.map_or(0.0, |p| p.confidence),
                rule_matches: args
                    .selection
                    .map(|s| s.rule_matches.clone())
                    .unwrap_or_default(),
                ai_verdict: args.selection.and_then(|s| s.ai_verdict.clone()),
            },
            agent_interactions: args.interactions,
            validation: args.report.map_or_else(
                || {
                    ValidationLog {
                        is_valid: true,
                        confidence_score: 1.0,
                        hallucination_detected: false,
                        per_agent: HashMap::new(),
                        issues: Vec::new(),
                    }
                },
                ValidationLog::from,
            ),
            retry_attempts: args.retry_attempts,
            timing: TimingLog {
                total_duration_ms: args.started.elapsed().as_millis() as u64,
                phases: args.phases,
            },
        };
        self.audit.enqueue(record);

        self.stats.record_request(
            args.kind,
            plan.map_or(crate::types::SelectionMethod::None, |p| p.method),
            args.started.elapsed(),
        );

        let event = if response.success {
            PipelineEvent::Completed {
                response: response.clone(),
            }
        } else {
            PipelineEvent::Error {
                response: response.clone(),
            }
        };
        emit(events, event).await;
    }
}

struct FinishArgs<'a> {
    request_id: RequestId,
    timestamp: DateTime<Utc>,
    started: Instant,
    request: &'a QueryRequest,
    user_id: String,
    category: ActionCategory,
    outcome: &'a str,
    kind: Option<ErrorKind>,
    selection: Option<&'a SelectionOutcome>,
    policy: Option<&'a crate::types::EvaluationResult>,
    interactions: Vec<AgentInteraction>,
    report: Option<&'a ValidationReport>,
    retry_attempts: Vec<RetryAttemptLog>,
    phases: HashMap<String, u64>,
}

async fn emit(events: &EventSink, event: PipelineEvent) {
    if let Some(tx) = events {
        // A closed channel means the client went away; cancellation handles
        // the rest.
        let _ = tx.send(event).await;
    }
}

fn injection_signatures() -> &'static [Regex] {
    static SIGNATURES: OnceLock<Vec<Regex>> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        [
            r"(?i)\b(drop\s+table|delete\s+from|insert\s+into|union\s+select)\b",
            r"(?i)\bor\s+1\s*=\s*1\b",
            r"[;&|`]\s*(rm|curl|wget|bash|sh|nc|python)\b",
            r"\$\(",
            r"\.\./\.\.",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("built-in injection signature"))
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injection_signatures() {
        let patterns = injection_signatures();
        let hit = |s: &str| patterns.iter().any(|p| p.is_match(s));
        assert!(hit("'; DROP TABLE users; --"));
        assert!(hit("x || 1=1 union select password from users"));
        assert!(hit("; rm -rf /"));
        assert!(hit("$(cat /etc/passwd)"));
        assert!(hit("../../etc/shadow"));

        assert!(!hit("calculate 15 + 27"));
        assert!(!hit("search for machine learning"));
        assert!(!hit("transfer 15000 to savings"));
    }

    #[test]
    fn test_response_serialization_has_no_confidence() {
        let response = PipelineResponse {
            success: true,
            request_id: RequestId::new(),
            data: Some(serde_json::Map::new()),
            metadata: Some(ResponseMetadata {
                agent_trail: vec!["calculator".into()],
                parallel: false,
                execution_time_ms: 3,
                reasoning: ReasoningMeta {
                    method: "rule_validated".into(),
                },
                validation_warning: None,
            }),
            display_text: Some("ok".into()),
            error: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("confidence"));
        assert!(json.contains("\"method\":\"rule_validated\""));
        // Absent warning is omitted entirely.
        assert!(!json.contains("validation_warning"));
    }

    #[test]
    fn test_event_names_match_contract() {
        let events: Vec<(PipelineEvent, &str)> = vec![
            (
                PipelineEvent::Started {
                    request_id: RequestId::new(),
                },
                "started",
            ),
            (PipelineEvent::SecurityValidation { passed: true }, "security_validation"),
            (PipelineEvent::ReasoningStarted, "reasoning_started"),
            (
                PipelineEvent::ReasoningComplete {
                    method: "rule".into(),
                    agents: vec![],
                    parallel: false,
                },
                "reasoning_complete",
            ),
            (PipelineEvent::AgentsExecuting { agents: vec![] }, "agents_executing"),
            (
                PipelineEvent::AgentOutput {
                    agent_name: "a".into(),
                    success: true,
                    data: serde_json::Value::Null,
                    fallback_used: false,
                },
                "agent_output",
            ),
            (
                PipelineEvent::Validation {
                    is_valid: true,
                    warning: None,
                },
                "validation",
            ),
        ];
        for (event, expected) in events {
            assert_eq!(event.name(), expected);
            assert!(!event.is_terminal());
        }
    }

    #[test]
    fn test_decorator_only_shapes_display_text() {
        let wrapper = ConversationalWrapper;
        let text = wrapper.decorate("calculator: {\"result\":42}", Some("s1"));
        assert!(text.contains("calculator"));
        assert!(text.contains("42"));
    }
}
