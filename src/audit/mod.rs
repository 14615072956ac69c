//! Per-query audit log.
//!
//! One JSON record per request, fully materialized before the response is
//! sent, then handed to a background worker over a bounded channel so disk
//! I/O never blocks the response path. Writes are atomic
//! (write-to-temp + rename). Queue overflow drops the record, counts the
//! drop, and logs it; drops are surfaced in metrics, never silent.

use crate::routing::hybrid::AiVerdictLog;
use crate::routing::rules::RuleMatch;
use crate::types::{
    ActionCategory, AgentResponse, AgentValidation, EvaluationResult, ValidationReport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs/queries")
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            log_dir: default_log_dir(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLog {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restriction_lift_time: Option<DateTime<Utc>>,
}

impl From<&EvaluationResult> for PolicyLog {
    fn from(result: &EvaluationResult) -> Self {
        Self {
            allowed: result.allowed,
            reason: result.reason.clone(),
            restriction_lift_time: result.restriction_lift_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningLog {
    pub method: String,
    pub selected_agents: Vec<String>,
    pub confidence: f64,
    pub rule_matches: Vec<RuleMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_verdict: Option<AiVerdictLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInteraction {
    pub agent_name: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub success: bool,
    pub execution_time_ms: u64,
    pub attempts: u32,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentInteraction {
    pub fn from_response(response: &AgentResponse, input: serde_json::Value) -> Self {
        Self {
            agent_name: response.agent_name.clone(),
            input,
            output: response.data.clone(),
            success: response.success,
            execution_time_ms: response.execution_time_ms,
            attempts: response.attempt_count,
            fallback_used: response.fallback_used,
            error: response.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationLog {
    pub is_valid: bool,
    pub confidence_score: f64,
    pub hallucination_detected: bool,
    pub per_agent: HashMap<String, AgentValidation>,
    pub issues: Vec<String>,
}

impl From<&ValidationReport> for ValidationLog {
    fn from(report: &ValidationReport) -> Self {
        let mut issues = report.consistency_issues.clone();
        issues.extend(report.overall_issues.iter().cloned());
        Self {
            is_valid: report.is_valid,
            confidence_score: report.confidence_score,
            hallucination_detected: report.hallucination_detected,
            per_agent: report.per_agent.clone(),
            issues,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttemptLog {
    pub reason: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingLog {
    pub total_duration_ms: u64,
    pub phases: HashMap<String, u64>,
}

/// The complete per-request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogRecord {
    pub query_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Echo of the request with secret-looking fields redacted.
    pub user_query: serde_json::Value,
    pub user_id: String,
    pub action_category: ActionCategory,
    /// Terminal state of the request: `completed`, `denied`, `no_agent`,
    /// `rejected`, `cancelled`, or `failed`.
    pub outcome: String,
    pub policy: PolicyLog,
    pub reasoning: ReasoningLog,
    pub agent_interactions: Vec<AgentInteraction>,
    pub validation: ValidationLog,
    pub retry_attempts: Vec<RetryAttemptLog>,
    pub timing: TimingLog,
}

const REDACTED_KEY_FRAGMENTS: &[&str] = &["password", "token", "secret", "api_key", "authorization"];

/// Replace the values of secret-looking keys, recursively.
pub fn redact(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let lower = key.to_lowercase();
                if REDACTED_KEY_FRAGMENTS.iter().any(|f| lower.contains(f)) {
                    redacted.insert(key.clone(), serde_json::Value::String("[redacted]".into()));
                } else {
                    redacted.insert(key.clone(), redact(val));
                }
            }
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact).collect())
        }
        other => other.clone(),
    }
}

/// Background query-log writer.
pub struct QueryLogWriter {
    tx: parking_lot::Mutex<Option<mpsc::Sender<QueryLogRecord>>>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueryLogWriter {
    /// Start the writer. With `enabled = false` every enqueue is a no-op.
    pub fn spawn(config: AuditConfig) -> Self {
        if !config.enabled {
            return Self {
                tx: parking_lot::Mutex::new(None),
                dropped: Arc::new(AtomicU64::new(0)),
                written: Arc::new(AtomicU64::new(0)),
                worker: parking_lot::Mutex::new(None),
            };
        }

        let (tx, mut rx) = mpsc::channel::<QueryLogRecord>(config.queue_capacity.max(1));
        let written = Arc::new(AtomicU64::new(0));
        let written_worker = written.clone();
        let log_dir = config.log_dir.clone();
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match write_record(&log_dir, &record).await {
                    Ok(path) => {
                        written_worker.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(path = %path.display(), "query log written");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, query_id = %record.query_id, "query log write failed");
                    }
                }
            }
        });

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            dropped: Arc::new(AtomicU64::new(0)),
            written,
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    /// Hand a finalized record to the background worker. Never blocks; a
    /// full queue drops the record and counts it.
    pub fn enqueue(&self, record: QueryLogRecord) {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else { return };
        if let Err(e) = tx.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let query_id = match e {
                mpsc::error::TrySendError::Full(r) => r.query_id,
                mpsc::error::TrySendError::Closed(r) => r.query_id,
            };
            tracing::warn!(%query_id, "audit queue full, query log dropped");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "audit worker did not shut down cleanly");
            }
        }
    }
}

/// Atomically write one record under `<dir>/<YYYY-MM-DD>/`.
pub async fn write_record(
    log_dir: &std::path::Path,
    record: &QueryLogRecord,
) -> Result<PathBuf, crate::types::AuditError> {
    let day_dir = log_dir.join(record.timestamp.format("%Y-%m-%d").to_string());
    let file_name = format!(
        "{}-{}.json",
        record.timestamp.timestamp_millis(),
        record.query_id
    );
    let path = day_dir.join(file_name);
    let json = serde_json::to_string_pretty(record)?;

    let write_path = path.clone();
    tokio::task::spawn_blocking(move || -> Result<(), crate::types::AuditError> {
        use std::io::Write;
        std::fs::create_dir_all(&day_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&day_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&write_path)
            .map_err(|e| crate::types::AuditError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| {
        crate::types::AuditError::Io(std::io::Error::other(format!(
            "audit write task panicked: {}",
            e
        )))
    })??;
    Ok(path)
}
