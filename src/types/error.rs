//! Error types for the orchestrator.

use std::time::Duration;
use thiserror::Error;

/// User-visible error classification, surfaced as `error.kind` in API
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input rejected pre-dispatch (size, injection signatures, denied field).
    Security,
    /// Selection returned none.
    NoAgent,
    /// A policy evaluator denied the request.
    PolicyDenied,
    /// All retries and fallback exhausted.
    AgentFailed,
    /// Agents returned but the validator could not accept the output.
    ValidationFailed,
    /// Deadline exceeded.
    Timeout,
    /// Unexpected fault.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Security => "security",
            ErrorKind::NoAgent => "no_agent",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::AgentFailed => "agent_failed",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("fallback cycle detected: {0}")]
    FallbackCycle(String),
}

/// Capability registry errors.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("agent '{0}' is already registered")]
    DuplicateName(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("agent '{0}' not found")]
    NotFound(String),
}

/// Errors from the reasoning client's upstream text-generation service.
#[derive(Error, Debug, Clone)]
pub enum ReasoningError {
    #[error("no text-generation provider configured")]
    Unavailable,

    #[error("reasoning request failed: {0}")]
    RequestFailed(String),

    #[error("reasoning request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },
}

/// Per-invocation agent errors. Retryability drives the retry loop:
/// timeouts, network faults, upstream 5xx, and explicitly-retryable errors
/// are retried; everything else fails the attempt immediately.
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invocation cancelled")]
    Cancelled,

    #[error("circuit open for '{agent}', next probe in {retry_in:?}")]
    CircuitOpen { agent: String, retry_in: Duration },

    #[error("rate limit exceeded for '{agent}', retry after {retry_after:?}")]
    RateLimited {
        agent: String,
        retry_after: Duration,
    },

    #[error("agent failed: {0}")]
    Failed(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Timeout(_) | AgentError::Network(_) | AgentError::Retryable(_) => true,
            AgentError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Policy layer errors (load-time only; evaluation itself never fails).
#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("invalid evaluator config for '{name}': {reason}")]
    InvalidEvaluator { name: String, reason: String },

    #[error("duplicate evaluator name: {0}")]
    DuplicateEvaluator(String),
}

/// Validation layer errors (schema catalogue problems, not verdicts).
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("unknown output schema: {0}")]
    UnknownSchema(String),

    #[error("schema '{name}' failed to compile: {reason}")]
    SchemaCompile { name: String, reason: String },
}

/// Query log writer errors.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit queue full, record dropped")]
    QueueFull,

    #[error("audit writer shut down")]
    Closed,
}

/// Top-level orchestrator error.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("reasoning error: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("internal error: {0}")]
    Internal(String),
}
