//! Declarative rule engine for agent selection.
//!
//! Rules are loaded from configuration, immutable afterwards, and evaluated
//! against the request's top-level fields. A rule matches iff every
//! condition atom matches; matches are ranked by `(priority desc, name asc)`.
//!
//! Keyword matching is case-insensitive whole-word against the target
//! field's string form. Field coercion: strings are themselves, lists are
//! space-joined, objects are flattened to `k=v` pairs.

use crate::types::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single condition atom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Any of `keywords` appears as a whole word in the field's string form.
    Keyword { field: String, keywords: Vec<String> },
    /// The key is present and non-null at the top level.
    FieldExists { field: String },
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },
    FieldRegex { field: String, pattern: String },
}

/// A declarative selection rule as authored in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    /// Declared confidence in `[0, 1]`.
    pub confidence: f64,
    pub conditions: Vec<RuleCondition>,
    pub target_agents: Vec<String>,
}

/// A rule match produced by evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_name: String,
    pub target_agents: Vec<String>,
    pub confidence: f64,
    pub priority: i32,
}

enum CompiledCondition {
    Keyword { field: String, patterns: Vec<Regex> },
    FieldExists { field: String },
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },
    FieldRegex { field: String, regex: Regex },
}

struct CompiledRule {
    name: String,
    priority: i32,
    confidence: f64,
    conditions: Vec<CompiledCondition>,
    target_agents: Vec<String>,
}

/// Immutable, pre-compiled rule set.
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

/// Coerce a JSON value to the string form conditions match against.
fn coerce_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(coerce_to_string)
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, coerce_to_string(v)))
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl RuleEngine {
    /// Compile the rule set. Regex patterns and keyword lists are validated
    /// here so evaluation never fails.
    pub fn new(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::Invalid("rule with empty name".into()));
            }
            if !(0.0..=1.0).contains(&rule.confidence) {
                return Err(ConfigError::Invalid(format!(
                    "rule '{}' confidence {} outside [0, 1]",
                    rule.name, rule.confidence
                )));
            }
            if rule.target_agents.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "rule '{}' targets no agents",
                    rule.name
                )));
            }
            let mut conditions = Vec::with_capacity(rule.conditions.len());
            for condition in rule.conditions {
                conditions.push(Self::compile_condition(&rule.name, condition)?);
            }
            compiled.push(CompiledRule {
                name: rule.name,
                priority: rule.priority,
                confidence: rule.confidence,
                conditions,
                target_agents: rule.target_agents,
            });
        }
        compiled.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(Self { rules: compiled })
    }

    fn compile_condition(
        rule_name: &str,
        condition: RuleCondition,
    ) -> Result<CompiledCondition, ConfigError> {
        match condition {
            RuleCondition::Keyword { field, keywords } => {
                if keywords.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "rule '{}' keyword condition on '{}' lists no keywords",
                        rule_name, field
                    )));
                }
                let patterns = keywords
                    .iter()
                    .map(|kw| {
                        Regex::new(&format!(r"\b{}\b", regex::escape(&kw.to_lowercase())))
                            .map_err(|e| {
                                ConfigError::Invalid(format!(
                                    "rule '{}' keyword '{}': {}",
                                    rule_name, kw, e
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledCondition::Keyword { field, patterns })
            }
            RuleCondition::FieldExists { field } => Ok(CompiledCondition::FieldExists { field }),
            RuleCondition::FieldEquals { field, value } => {
                Ok(CompiledCondition::FieldEquals { field, value })
            }
            RuleCondition::FieldRegex { field, pattern } => {
                let regex = Regex::new(&pattern).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "rule '{}' regex '{}': {}",
                        rule_name, pattern, e
                    ))
                })?;
                Ok(CompiledCondition::FieldRegex { field, regex })
            }
        }
    }

    /// Evaluate every rule against the request fields, returning matches
    /// ranked `(priority desc, name asc)`.
    pub fn evaluate(&self, input: &serde_json::Map<String, serde_json::Value>) -> Vec<RuleMatch> {
        self.rules
            .iter()
            .filter(|rule| rule.conditions.iter().all(|c| Self::matches(c, input)))
            .map(|rule| RuleMatch {
                rule_name: rule.name.clone(),
                target_agents: rule.target_agents.clone(),
                confidence: rule.confidence,
                priority: rule.priority,
            })
            .collect()
    }

    fn matches(
        condition: &CompiledCondition,
        input: &serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        match condition {
            CompiledCondition::Keyword { field, patterns } => match input.get(field) {
                Some(value) => {
                    let haystack = coerce_to_string(value).to_lowercase();
                    patterns.iter().any(|p| p.is_match(&haystack))
                }
                None => false,
            },
            CompiledCondition::FieldExists { field } => {
                matches!(input.get(field), Some(v) if !v.is_null())
            }
            CompiledCondition::FieldEquals { field, value } => {
                input.get(field) == Some(value)
            }
            CompiledCondition::FieldRegex { field, regex } => match input.get(field) {
                Some(value) => regex.is_match(&coerce_to_string(value)),
                None => false,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
