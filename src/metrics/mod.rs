//! Request statistics and Prometheus export.
//!
//! Counters are atomics and small concurrent maps updated on the request
//! path; `/stats` serves a JSON snapshot and `/metrics` renders the
//! Prometheus text format (counters carry the `_total` suffix).

use crate::types::{AgentHealthSnapshot, ErrorKind, SelectionMethod};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct StatsCollector {
    started_at: Instant,
    total_requests: AtomicU64,
    total_latency_ms: AtomicU64,
    outcomes: DashMap<String, u64>,
    methods: DashMap<String, u64>,
    evaluator_denials: DashMap<String, u64>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            outcomes: DashMap::new(),
            methods: DashMap::new(),
            evaluator_denials: DashMap::new(),
        }
    }

    /// Record one finished request. `outcome` is `None` on success.
    pub fn record_request(
        &self,
        outcome: Option<ErrorKind>,
        method: SelectionMethod,
        latency: Duration,
    ) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        let key = outcome.map_or_else(|| "success".to_string(), |k| k.to_string());
        *self.outcomes.entry(key).or_insert(0) += 1;
        *self.methods.entry(method.to_string()).or_insert(0) += 1;
    }

    pub fn record_evaluator_denial(&self, evaluator: &str) {
        *self
            .evaluator_denials
            .entry(evaluator.to_string())
            .or_insert(0) += 1;
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(
        &self,
        agents: Vec<(String, AgentHealthSnapshot)>,
        audit_written: u64,
        audit_dropped: u64,
    ) -> StatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let latency_sum = self.total_latency_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_seconds: self.uptime().as_secs(),
            total_requests: total,
            avg_latency_ms: if total > 0 {
                latency_sum as f64 / total as f64
            } else {
                0.0
            },
            outcomes: self.map_snapshot(&self.outcomes),
            reasoning_methods: self.map_snapshot(&self.methods),
            evaluator_denials: self.map_snapshot(&self.evaluator_denials),
            agents: agents.into_iter().collect(),
            audit: AuditStats {
                written: audit_written,
                dropped: audit_dropped,
            },
        }
    }

    fn map_snapshot(&self, map: &DashMap<String, u64>) -> std::collections::BTreeMap<String, u64> {
        map.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    /// Render the Prometheus text exposition format.
    pub fn render_prometheus(
        &self,
        agents: &[(String, AgentHealthSnapshot)],
        audit_dropped: u64,
    ) -> String {
        let mut out = String::with_capacity(2048);

        let _ = writeln!(out, "# HELP conductor_uptime_seconds Server uptime.");
        let _ = writeln!(out, "# TYPE conductor_uptime_seconds gauge");
        let _ = writeln!(out, "conductor_uptime_seconds {}", self.uptime().as_secs());

        let _ = writeln!(out, "# HELP conductor_requests_total Requests processed.");
        let _ = writeln!(out, "# TYPE conductor_requests_total counter");
        let _ = writeln!(
            out,
            "conductor_requests_total {}",
            self.total_requests.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP conductor_request_outcomes_total Requests by terminal outcome."
        );
        let _ = writeln!(out, "# TYPE conductor_request_outcomes_total counter");
        for entry in self.outcomes.iter() {
            let _ = writeln!(
                out,
                "conductor_request_outcomes_total{{outcome=\"{}\"}} {}",
                entry.key(),
                entry.value()
            );
        }

        let _ = writeln!(
            out,
            "# HELP conductor_reasoning_method_total Selection plans by method."
        );
        let _ = writeln!(out, "# TYPE conductor_reasoning_method_total counter");
        for entry in self.methods.iter() {
            let _ = writeln!(
                out,
                "conductor_reasoning_method_total{{method=\"{}\"}} {}",
                entry.key(),
                entry.value()
            );
        }

        let _ = writeln!(
            out,
            "# HELP conductor_evaluator_denials_total Policy denials by evaluator."
        );
        let _ = writeln!(out, "# TYPE conductor_evaluator_denials_total counter");
        for entry in self.evaluator_denials.iter() {
            let _ = writeln!(
                out,
                "conductor_evaluator_denials_total{{evaluator=\"{}\"}} {}",
                entry.key(),
                entry.value()
            );
        }

        let _ = writeln!(out, "# HELP conductor_agent_calls_total Agent invocations.");
        let _ = writeln!(out, "# TYPE conductor_agent_calls_total counter");
        for (name, health) in agents {
            let _ = writeln!(
                out,
                "conductor_agent_calls_total{{agent=\"{}\"}} {}",
                name, health.call_count
            );
        }

        let _ = writeln!(
            out,
            "# HELP conductor_agent_failures_total Failed agent invocations."
        );
        let _ = writeln!(out, "# TYPE conductor_agent_failures_total counter");
        for (name, health) in agents {
            let _ = writeln!(
                out,
                "conductor_agent_failures_total{{agent=\"{}\"}} {}",
                name, health.failure_count
            );
        }

        let _ = writeln!(
            out,
            "# HELP conductor_agent_avg_execution_ms Mean agent execution time."
        );
        let _ = writeln!(out, "# TYPE conductor_agent_avg_execution_ms gauge");
        for (name, health) in agents {
            let _ = writeln!(
                out,
                "conductor_agent_avg_execution_ms{{agent=\"{}\"}} {:.3}",
                name, health.avg_execution_time_ms
            );
        }

        let _ = writeln!(
            out,
            "# HELP conductor_agent_healthy Whether the agent circuit is not open."
        );
        let _ = writeln!(out, "# TYPE conductor_agent_healthy gauge");
        for (name, health) in agents {
            let _ = writeln!(
                out,
                "conductor_agent_healthy{{agent=\"{}\"}} {}",
                name,
                u8::from(health.is_healthy)
            );
        }

        let _ = writeln!(
            out,
            "# HELP conductor_audit_dropped_total Query log records dropped on queue overflow."
        );
        let _ = writeln!(out, "# TYPE conductor_audit_dropped_total counter");
        let _ = writeln!(out, "conductor_audit_dropped_total {}", audit_dropped);

        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub written: u64,
    pub dropped: u64,
}

/// The `/stats` payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub avg_latency_ms: f64,
    pub outcomes: std::collections::BTreeMap<String, u64>,
    pub reasoning_methods: std::collections::BTreeMap<String, u64>,
    pub evaluator_denials: std::collections::BTreeMap<String, u64>,
    pub agents: std::collections::BTreeMap<String, AgentHealthSnapshot>,
    pub audit: AuditStats,
}
