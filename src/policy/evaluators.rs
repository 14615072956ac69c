//! Policy evaluators.
//!
//! Evaluators are pure over (request, user history): no side effects, no
//! state. The built-in variants are a closed tagged enum validated at load
//! time; bespoke policies plug in through the [`Evaluator`] trait. The
//! registry runs evaluators in declared order and the first denial
//! short-circuits.

use super::history::ActionHistory;
use crate::types::{ActionCategory, EvaluationResult, PolicyError};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A pure policy check.
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        user_id: &str,
        category: ActionCategory,
        metadata: &HashMap<String, serde_json::Value>,
        history: &ActionHistory,
    ) -> EvaluationResult;
}

/// Built-in evaluator variants as authored in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluatorSpec {
    /// Deny `blocked_categories` for `block_hours` after any
    /// `trigger_category` action.
    TimedRestriction {
        trigger_category: ActionCategory,
        blocked_categories: Vec<ActionCategory>,
        block_hours: i64,
    },
    /// Deny when the user already performed `max_count` actions of the
    /// requested category inside the window.
    RateLimit {
        max_count: usize,
        window_hours: i64,
        /// When set, only these categories are rate limited.
        #[serde(default)]
        categories: Option<Vec<ActionCategory>>,
    },
    /// Deny when `metadata[field]` is a number above `max_value`.
    Threshold { field: String, max_value: f64 },
    /// Resolved against the custom implementations supplied by the
    /// embedding application.
    Custom,
}

/// One entry of the evaluators config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorEntry {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub spec: EvaluatorSpec,
}

fn default_enabled() -> bool {
    true
}

struct TimedRestriction {
    name: String,
    trigger_category: ActionCategory,
    blocked_categories: Vec<ActionCategory>,
    block_hours: i64,
}

impl Evaluator for TimedRestriction {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        user_id: &str,
        category: ActionCategory,
        _metadata: &HashMap<String, serde_json::Value>,
        history: &ActionHistory,
    ) -> EvaluationResult {
        if !self.blocked_categories.contains(&category) {
            return EvaluationResult::allow();
        }
        let window_start = Utc::now() - Duration::hours(self.block_hours);
        match history.last(user_id, self.trigger_category) {
            Some(trigger) if trigger.timestamp >= window_start => {
                let lift = trigger.timestamp + Duration::hours(self.block_hours);
                EvaluationResult::deny(format!(
                    "{} is blocked for {} hours after a {} (lifts at {})",
                    category,
                    self.block_hours,
                    self.trigger_category,
                    lift.to_rfc3339()
                ))
                .with_lift_time(lift)
            }
            _ => EvaluationResult::allow(),
        }
    }
}

struct RateLimit {
    name: String,
    max_count: usize,
    window_hours: i64,
    categories: Option<Vec<ActionCategory>>,
}

impl Evaluator for RateLimit {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        user_id: &str,
        category: ActionCategory,
        _metadata: &HashMap<String, serde_json::Value>,
        history: &ActionHistory,
    ) -> EvaluationResult {
        if let Some(ref categories) = self.categories {
            if !categories.contains(&category) {
                return EvaluationResult::allow();
            }
        }
        let since = Utc::now() - Duration::hours(self.window_hours);
        let count = history.count(user_id, category, since);
        if count >= self.max_count {
            EvaluationResult::deny(format!(
                "limit of {} {} action(s) per {} hours reached",
                self.max_count, category, self.window_hours
            ))
        } else {
            EvaluationResult::allow()
        }
    }
}

struct Threshold {
    name: String,
    field: String,
    max_value: f64,
}

impl Evaluator for Threshold {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        _user_id: &str,
        _category: ActionCategory,
        metadata: &HashMap<String, serde_json::Value>,
        _history: &ActionHistory,
    ) -> EvaluationResult {
        match metadata.get(&self.field).and_then(|v| v.as_f64()) {
            Some(value) if value > self.max_value => EvaluationResult::deny(format!(
                "{} of {} exceeds the limit of {}",
                self.field, value, self.max_value
            )),
            _ => EvaluationResult::allow(),
        }
    }
}

/// The decision plus which evaluator denied, for stats and logging.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub result: EvaluationResult,
    pub denied_by: Option<String>,
}

impl PolicyDecision {
    pub fn allowed() -> Self {
        Self {
            result: EvaluationResult::allow(),
            denied_by: None,
        }
    }
}

/// Ordered evaluator chain.
pub struct EvaluatorRegistry {
    evaluators: Vec<Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    /// Build the chain from config entries. `Custom` entries are resolved
    /// against `custom_impls` by name; disabled entries are skipped.
    pub fn from_entries(
        entries: Vec<EvaluatorEntry>,
        mut custom_impls: HashMap<String, Arc<dyn Evaluator>>,
    ) -> Result<Self, PolicyError> {
        let mut evaluators: Vec<Arc<dyn Evaluator>> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in entries {
            if !seen.insert(entry.name.clone()) {
                return Err(PolicyError::DuplicateEvaluator(entry.name));
            }
            if !entry.enabled {
                continue;
            }
            let evaluator: Arc<dyn Evaluator> = match entry.spec {
                EvaluatorSpec::TimedRestriction {
                    trigger_category,
                    blocked_categories,
                    block_hours,
                } => {
                    if block_hours <= 0 {
                        return Err(PolicyError::InvalidEvaluator {
                            name: entry.name,
                            reason: "block_hours must be positive".into(),
                        });
                    }
                    if blocked_categories.is_empty() {
                        return Err(PolicyError::InvalidEvaluator {
                            name: entry.name,
                            reason: "blocked_categories must be non-empty".into(),
                        });
                    }
                    Arc::new(TimedRestriction {
                        name: entry.name,
                        trigger_category,
                        blocked_categories,
                        block_hours,
                    })
                }
                EvaluatorSpec::RateLimit {
                    max_count,
                    window_hours,
                    categories,
                } => {
                    if max_count == 0 || window_hours <= 0 {
                        return Err(PolicyError::InvalidEvaluator {
                            name: entry.name,
                            reason: "max_count and window_hours must be positive".into(),
                        });
                    }
                    Arc::new(RateLimit {
                        name: entry.name,
                        max_count,
                        window_hours,
                        categories,
                    })
                }
                EvaluatorSpec::Threshold { field, max_value } => {
                    if field.is_empty() {
                        return Err(PolicyError::InvalidEvaluator {
                            name: entry.name,
                            reason: "field must be non-empty".into(),
                        });
                    }
                    Arc::new(Threshold {
                        name: entry.name,
                        field,
                        max_value,
                    })
                }
                EvaluatorSpec::Custom => custom_impls.remove(&entry.name).ok_or_else(|| {
                    PolicyError::InvalidEvaluator {
                        name: entry.name.clone(),
                        reason: "no custom implementation registered under this name".into(),
                    }
                })?,
            };
            evaluators.push(evaluator);
        }
        Ok(Self { evaluators })
    }

    /// Run the chain in order; the first denial wins.
    pub fn evaluate(
        &self,
        user_id: &str,
        category: ActionCategory,
        metadata: &HashMap<String, serde_json::Value>,
        history: &ActionHistory,
    ) -> PolicyDecision {
        for evaluator in &self.evaluators {
            let result = evaluator.evaluate(user_id, category, metadata, history);
            if !result.allowed {
                tracing::info!(
                    evaluator = evaluator.name(),
                    user = user_id,
                    %category,
                    "policy denied"
                );
                return PolicyDecision {
                    result,
                    denied_by: Some(evaluator.name().to_string()),
                };
            }
        }
        PolicyDecision::allowed()
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }
}
