//! Configuration loading and validation.
//!
//! All configuration is YAML, loaded once at startup. `${NAME:default}`
//! environment references are substituted into the raw text before parsing.
//! Validation happens at load: thresholds must be in range, agent names
//! unique, fallback chains acyclic, and referenced output schemas present.

use crate::audit::AuditConfig;
use crate::exec::ExecutionConfig;
use crate::policy::evaluators::EvaluatorEntry;
use crate::policy::history::HistoryConfig;
use crate::routing::hybrid::HybridConfig;
use crate::routing::rules::Rule;
use crate::types::{AgentDescriptor, ConfigError};
use crate::validation::ValidationConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            enable_cors: true,
            cors_origins: Vec::new(),
            auth: AuthConfig::default(),
        }
    }
}

/// Bearer-token authentication. Disabled by default; when enabled the token
/// is compared constant-time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Reasoning-layer settings: the hybrid thresholds plus the hard per-call
/// timeout for the upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSettings {
    #[serde(flatten)]
    pub hybrid: HybridConfig,
    #[serde(default = "default_reasoning_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_reasoning_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            hybrid: HybridConfig::default(),
            request_timeout: default_reasoning_timeout(),
        }
    }
}

/// Input size and safety limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

fn default_max_request_bytes() -> usize {
    64 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// The orchestrator config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reasoning: ReasoningSettings,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// One agents-file entry: the descriptor plus an optional HTTP endpoint for
/// remote agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigEntry {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AgentsFile {
    #[serde(default)]
    agents: Vec<AgentConfigEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EvaluatorsFile {
    #[serde(default)]
    evaluators: Vec<EvaluatorEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SchemasFile {
    #[serde(default)]
    schemas: HashMap<String, PathBuf>,
}

/// File locations for the whole bundle. Only the orchestrator file is
/// required.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub orchestrator: PathBuf,
    pub agents: Option<PathBuf>,
    pub rules: Option<PathBuf>,
    pub evaluators: Option<PathBuf>,
    pub schemas: Option<PathBuf>,
}

/// Everything loaded from disk, validated and ready to build an
/// orchestrator from.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub orchestrator: OrchestratorConfig,
    pub agents: Vec<AgentConfigEntry>,
    pub rules: Vec<Rule>,
    pub evaluators: Vec<EvaluatorEntry>,
    pub schema_files: HashMap<String, PathBuf>,
}

impl ConfigBundle {
    pub fn load(paths: &ConfigPaths) -> Result<Self, ConfigError> {
        let orchestrator: OrchestratorConfig = load_yaml(&paths.orchestrator)?;
        let agents = match &paths.agents {
            Some(path) => load_yaml::<AgentsFile>(path)?.agents,
            None => Vec::new(),
        };
        let rules = match &paths.rules {
            Some(path) => load_yaml::<RulesFile>(path)?.rules,
            None => Vec::new(),
        };
        let evaluators = match &paths.evaluators {
            Some(path) => load_yaml::<EvaluatorsFile>(path)?.evaluators,
            None => Vec::new(),
        };
        let schema_files = match &paths.schemas {
            Some(path) => {
                let file = load_yaml::<SchemasFile>(path)?;
                // Schema paths are relative to the schemas file itself.
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                file.schemas
                    .into_iter()
                    .map(|(name, p)| {
                        let resolved = if p.is_absolute() { p } else { base.join(p) };
                        (name, resolved)
                    })
                    .collect()
            }
            None => HashMap::new(),
        };

        let bundle = Self {
            orchestrator,
            agents,
            rules,
            evaluators,
            schema_files,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (label, value) in [
            (
                "reasoning.rule_confidence_threshold",
                self.orchestrator.reasoning.hybrid.rule_confidence_threshold,
            ),
            (
                "reasoning.ai_override_min",
                self.orchestrator.reasoning.hybrid.ai_override_min,
            ),
            (
                "validation.confidence_threshold",
                self.orchestrator.validation.confidence_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in [0, 1], got {}",
                    label, value
                )));
            }
        }
        if self.orchestrator.execution.max_parallel_agents == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_parallel_agents must be at least 1".into(),
            ));
        }

        let mut names = HashSet::new();
        for entry in &self.agents {
            let descriptor = &entry.descriptor;
            if descriptor.name.trim().is_empty() {
                return Err(ConfigError::MissingField("agent name".into()));
            }
            if !names.insert(descriptor.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent name '{}'",
                    descriptor.name
                )));
            }
            if descriptor.capabilities.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}' declares no capabilities",
                    descriptor.name
                )));
            }
            if let Some(ref schema) = descriptor.output_schema_name {
                if !self.schema_files.contains_key(schema) {
                    return Err(ConfigError::Invalid(format!(
                        "agent '{}' references unknown output schema '{}'",
                        descriptor.name, schema
                    )));
                }
            }
        }

        self.check_fallback_cycles()?;

        for rule in &self.rules {
            for target in &rule.target_agents {
                if !names.contains(target) {
                    tracing::warn!(
                        rule = %rule.name,
                        agent = %target,
                        "rule targets an agent not present in the agents config"
                    );
                }
            }
        }
        Ok(())
    }

    /// DFS over the fallback-name graph. Fallbacks are stored as names and
    /// resolved at dispatch; a cycle would retry forever, so it is a
    /// load-time error.
    fn check_fallback_cycles(&self) -> Result<(), ConfigError> {
        let fallbacks: HashMap<&str, &str> = self
            .agents
            .iter()
            .filter_map(|e| {
                e.descriptor
                    .fallback_name
                    .as_deref()
                    .map(|f| (e.descriptor.name.as_str(), f))
            })
            .collect();

        for start in fallbacks.keys() {
            let mut seen = HashSet::new();
            let mut current = *start;
            while let Some(next) = fallbacks.get(current) {
                if !seen.insert(current) {
                    return Err(ConfigError::FallbackCycle(format!(
                        "agent '{}' participates in a fallback loop",
                        start
                    )));
                }
                current = next;
            }
        }
        Ok(())
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
    let substituted = substitute_env(&raw);
    serde_yaml::from_str(&substituted)
        .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
}

/// Substitute `${NAME}` and `${NAME:default}` environment references.
/// Unset variables without a default substitute to the empty string.
pub fn substitute_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}")
        .expect("env substitution pattern");
    pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => caps.get(2).map_or(String::new(), |m| m.as_str().to_string()),
            }
        })
        .into_owned()
}
