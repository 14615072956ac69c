//! Wire types for the non-query endpoints.

use crate::types::{AgentHealthSnapshot, CircuitState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-agent status in the health summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentHealthEntry {
    pub status: AgentStatus,
    pub circuit_state: CircuitState,
    pub call_count: u64,
    pub failure_count: u64,
    pub avg_execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<DateTime<Utc>>,
}

impl From<&AgentHealthSnapshot> for AgentHealthEntry {
    fn from(health: &AgentHealthSnapshot) -> Self {
        Self {
            status: classify(health),
            circuit_state: health.circuit_state,
            call_count: health.call_count,
            failure_count: health.failure_count,
            avg_execution_time_ms: health.avg_execution_time_ms,
            open_until: health.open_until,
        }
    }
}

/// An open circuit is down; a half-open circuit or a majority-failure
/// record is degraded.
fn classify(health: &AgentHealthSnapshot) -> AgentStatus {
    match health.circuit_state {
        CircuitState::Open => AgentStatus::Down,
        CircuitState::HalfOpen => AgentStatus::Degraded,
        CircuitState::Closed => {
            if health.call_count > 0 && health.failure_count * 2 > health.call_count {
                AgentStatus::Degraded
            } else {
                AgentStatus::Up
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `healthy`, `degraded`, or `unhealthy`.
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    /// Label of the configured reasoning provider, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_provider: Option<String>,
    pub agents: BTreeMap<String, AgentHealthEntry>,
}

impl HealthResponse {
    pub fn build(
        uptime_seconds: u64,
        reasoning_provider: Option<String>,
        agents: Vec<(String, AgentHealthSnapshot)>,
    ) -> Self {
        let entries: BTreeMap<String, AgentHealthEntry> = agents
            .iter()
            .map(|(name, health)| (name.clone(), AgentHealthEntry::from(health)))
            .collect();
        let status = if entries.values().all(|e| e.status == AgentStatus::Up) {
            "healthy"
        } else if entries.values().any(|e| e.status != AgentStatus::Down) {
            "degraded"
        } else {
            "unhealthy"
        };
        Self {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            timestamp: Utc::now(),
            reasoning_provider,
            agents: entries,
        }
    }
}
