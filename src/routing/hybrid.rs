//! Hybrid selection policy.
//!
//! Combines the rule engine with the reasoning client under a
//! confidence-threshold policy. The governing decision: never execute a
//! low-confidence wrong agent. When neither rules nor the reasoning
//! client produce a selection we trust, the plan is `none` and the user
//! gets a clean "no suitable agent" instead of a fabricated answer.

use super::rules::{RuleEngine, RuleMatch};
use crate::reasoning::{ReasoningClient, ValidationVerdict};
use crate::registry::CapabilityRegistry;
use crate::types::{PlanParameters, SelectionMethod, SelectionPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    /// Rules only; the reasoning client is never consulted.
    Rules,
    /// Reasoning client only; rules are ignored.
    Ai,
    /// Rules first, validated and potentially overridden by the client.
    #[default]
    Hybrid,
}

/// Thresholds for the hybrid policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default)]
    pub mode: ReasoningMode,
    /// Rule matches at or above this confidence are trusted enough to
    /// validate rather than reselect.
    #[serde(default = "default_rule_confidence_threshold")]
    pub rule_confidence_threshold: f64,
    /// Minimum verdict confidence for an AI suggestion to be accepted.
    #[serde(default = "default_ai_override_min")]
    pub ai_override_min: f64,
}

fn default_rule_confidence_threshold() -> f64 {
    0.7
}

fn default_ai_override_min() -> f64 {
    0.5
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            mode: ReasoningMode::default(),
            rule_confidence_threshold: default_rule_confidence_threshold(),
            ai_override_min: default_ai_override_min(),
        }
    }
}

/// Verdict summary carried into the query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiVerdictLog {
    pub is_valid: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_agents: Vec<String>,
}

impl From<&ValidationVerdict> for AiVerdictLog {
    fn from(v: &ValidationVerdict) -> Self {
        Self {
            is_valid: v.is_valid,
            confidence: v.confidence,
            reasoning: v.reasoning.clone(),
            suggested_agents: v.suggested_agents.clone(),
        }
    }
}

/// The plan plus the evidence that produced it.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub plan: SelectionPlan,
    pub rule_matches: Vec<RuleMatch>,
    pub ai_verdict: Option<AiVerdictLog>,
}

pub struct HybridReasoner {
    rules: RuleEngine,
    client: Arc<ReasoningClient>,
    registry: Arc<CapabilityRegistry>,
    config: HybridConfig,
}

impl HybridReasoner {
    pub fn new(
        rules: RuleEngine,
        client: Arc<ReasoningClient>,
        registry: Arc<CapabilityRegistry>,
        config: HybridConfig,
    ) -> Self {
        Self {
            rules,
            client,
            registry,
            config,
        }
    }

    /// Produce the selection plan for a request.
    pub async fn select(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
    ) -> SelectionOutcome {
        let rule_matches = if self.config.mode == ReasoningMode::Ai {
            Vec::new()
        } else {
            self.selectable_matches(input)
        };

        if rule_matches.is_empty() {
            let outcome = self.select_from_scratch(input, SelectionMethod::Ai).await;
            return SelectionOutcome {
                rule_matches,
                ..outcome
            };
        }

        let above: Vec<&RuleMatch> = rule_matches
            .iter()
            .filter(|m| m.confidence >= self.config.rule_confidence_threshold)
            .collect();

        if above.is_empty() {
            // Rules matched but none confidently: escalate to the client.
            let outcome = self
                .select_from_scratch(input, SelectionMethod::Hybrid)
                .await;
            return SelectionOutcome {
                rule_matches,
                ..outcome
            };
        }

        let agents = union_preserving_order(&above);
        let confidence =
            above.iter().map(|m| m.confidence).sum::<f64>() / above.len() as f64;
        let multi = above.len() > 1;

        if self.config.mode == ReasoningMode::Rules || !self.client.is_available() {
            let plan = SelectionPlan {
                agents,
                parallel: multi,
                confidence,
                method: SelectionMethod::Rule,
                reasoning: format!("matched {} rule(s), reasoning client not consulted", above.len()),
                parameters: PlanParameters::new(),
            };
            return SelectionOutcome {
                plan,
                rule_matches,
                ai_verdict: None,
            };
        }

        let snapshot = self.registry.all_enabled();
        match self.client.validate(input, &agents, &snapshot).await {
            None => {
                // Service went away mid-flight: degrade to the rule pick.
                let plan = SelectionPlan {
                    agents,
                    parallel: multi,
                    confidence,
                    method: SelectionMethod::Rule,
                    reasoning: "rule selection, reasoning service unavailable".into(),
                    parameters: PlanParameters::new(),
                };
                SelectionOutcome {
                    plan,
                    rule_matches,
                    ai_verdict: None,
                }
            }
            Some(verdict) if verdict.is_valid => {
                let method = if multi {
                    SelectionMethod::RuleMultiValidated
                } else {
                    SelectionMethod::RuleValidated
                };
                let parameters = self.fill_parameters(input, &agents, &verdict).await;
                let plan = SelectionPlan {
                    agents,
                    parallel: multi,
                    confidence,
                    method,
                    reasoning: verdict.reasoning.clone(),
                    parameters,
                };
                SelectionOutcome {
                    plan,
                    rule_matches,
                    ai_verdict: Some(AiVerdictLog::from(&verdict)),
                }
            }
            Some(verdict) => {
                let ai_verdict = Some(AiVerdictLog::from(&verdict));
                let plan = self.accept_suggestion(verdict, SelectionMethod::AiOverride);
                SelectionOutcome {
                    plan,
                    rule_matches,
                    ai_verdict,
                }
            }
        }
    }

    /// Rule matches whose targets survive the registered/enabled/selectable
    /// filter.
    fn selectable_matches(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<RuleMatch> {
        self.rules
            .evaluate(input)
            .into_iter()
            .filter_map(|mut m| {
                m.target_agents.retain(|a| self.registry.is_selectable(a));
                if m.target_agents.is_empty() {
                    None
                } else {
                    Some(m)
                }
            })
            .collect()
    }

    async fn select_from_scratch(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
        method: SelectionMethod,
    ) -> SelectionOutcome {
        if !self.client.is_available() || self.config.mode == ReasoningMode::Rules {
            return SelectionOutcome {
                plan: SelectionPlan::none("no confident rule match and no reasoning service"),
                rule_matches: Vec::new(),
                ai_verdict: None,
            };
        }
        let snapshot = self.registry.all_enabled();
        match self.client.select(input, &snapshot).await {
            None => SelectionOutcome {
                plan: SelectionPlan::none("reasoning service unavailable"),
                rule_matches: Vec::new(),
                ai_verdict: None,
            },
            Some(verdict) => {
                let ai_verdict = Some(AiVerdictLog::from(&verdict));
                let plan = self.accept_suggestion(verdict, method);
                SelectionOutcome {
                    plan,
                    rule_matches: Vec::new(),
                    ai_verdict,
                }
            }
        }
    }

    /// Accept the verdict's suggested agents if the verdict clears the
    /// override minimum and every suggested agent is selectable; otherwise
    /// the plan is `none`.
    fn accept_suggestion(
        &self,
        verdict: ValidationVerdict,
        method: SelectionMethod,
    ) -> SelectionPlan {
        if verdict.confidence < self.config.ai_override_min {
            return SelectionPlan::none(format!(
                "suggestion confidence {:.2} below minimum {:.2}",
                verdict.confidence, self.config.ai_override_min
            ));
        }
        if verdict.suggested_agents.is_empty() {
            return SelectionPlan::none("reasoning service suggested no agent");
        }
        let unknown: Vec<&String> = verdict
            .suggested_agents
            .iter()
            .filter(|a| !self.registry.is_selectable(a))
            .collect();
        if !unknown.is_empty() {
            return SelectionPlan::none(format!(
                "suggested agent(s) not selectable: {:?}",
                unknown
            ));
        }
        let parallel = verdict.suggested_agents.len() > 1;
        SelectionPlan {
            agents: verdict.suggested_agents,
            parallel,
            confidence: verdict.confidence,
            method,
            reasoning: verdict.reasoning,
            parameters: verdict.parameters,
        }
    }

    /// Use the verdict's parameters, falling back to a dedicated extraction
    /// call when the verdict carried none.
    async fn fill_parameters(
        &self,
        input: &serde_json::Map<String, serde_json::Value>,
        agents: &[String],
        verdict: &ValidationVerdict,
    ) -> PlanParameters {
        if !verdict.parameters.is_empty() {
            return verdict.parameters.clone();
        }
        self.client
            .extract_parameters(input, agents)
            .await
            .unwrap_or_default()
    }
}

fn union_preserving_order(matches: &[&RuleMatch]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut agents = Vec::new();
    for m in matches {
        for agent in &m.target_agents {
            if seen.insert(agent.clone()) {
                agents.push(agent.clone());
            }
        }
    }
    agents
}
