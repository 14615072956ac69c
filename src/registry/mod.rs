//! Agent capability registry.
//!
//! Owns the agent descriptors, the capability → agents inverted index, and
//! the per-agent health state (counters, circuit breaker, rate window).
//! Selection reads are hot, so the primary map and index live in `DashMap`s;
//! counters are atomics and the few non-atomic fields sit behind short
//! `parking_lot` critical sections.

pub mod remote;

use crate::exec::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::types::{
    AgentDescriptor, AgentError, AgentHealthSnapshot, RegistryError, RequestId,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context handed to every agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: RequestId,
    /// Cooperative cancellation: agents should abandon work promptly when
    /// this fires.
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(request_id: RequestId, cancel: CancellationToken) -> Self {
        Self { request_id, cancel }
    }
}

/// The agent contract: a named unit that consumes a structured input and
/// produces a structured output. Implementations may be in-process or
/// remote (see [`remote::HttpAgent`]).
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        ctx: &InvocationContext,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError>;
}

/// Tumbling-minute request window for per-agent rate limiting.
#[derive(Debug, Default)]
struct RateWindow {
    minute_epoch: u64,
    count: u32,
}

struct AgentEntry {
    descriptor: AgentDescriptor,
    agent: Arc<dyn Agent>,
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// Running average execution time; updated under a short lock since it
    /// is not a plain counter.
    avg_execution_time_ms: Mutex<f64>,
    breaker: Mutex<CircuitBreaker>,
    rate_window: Mutex<RateWindow>,
}

/// Thread-safe registry of agents keyed by name, with a capability index.
pub struct CapabilityRegistry {
    agents: DashMap<String, Arc<AgentEntry>>,
    /// capability tag → agent names, in registration order.
    by_capability: DashMap<String, Vec<String>>,
    breaker_config: CircuitBreakerConfig,
}

impl CapabilityRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            agents: DashMap::new(),
            by_capability: DashMap::new(),
            breaker_config,
        }
    }

    /// Register an agent under its descriptor. Capabilities are lowercased;
    /// the name must be unique and non-empty.
    pub fn register(
        &self,
        mut descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
    ) -> Result<(), RegistryError> {
        if descriptor.name.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor(
                "agent name must be non-empty".into(),
            ));
        }
        if descriptor.capabilities.is_empty() {
            return Err(RegistryError::InvalidDescriptor(format!(
                "agent '{}' declares no capabilities",
                descriptor.name
            )));
        }
        if self.agents.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }

        descriptor.capabilities = descriptor
            .capabilities
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if descriptor.capabilities.is_empty() {
            return Err(RegistryError::InvalidDescriptor(format!(
                "agent '{}' has only blank capability tags",
                descriptor.name
            )));
        }

        let name = descriptor.name.clone();
        for cap in &descriptor.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .push(name.clone());
        }

        let entry = Arc::new(AgentEntry {
            descriptor,
            agent,
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            avg_execution_time_ms: Mutex::new(0.0),
            breaker: Mutex::new(CircuitBreaker::new(self.breaker_config.clone())),
            rate_window: Mutex::new(RateWindow::default()),
        });
        self.agents.insert(name.clone(), entry);
        tracing::info!(agent = %name, "registered");
        Ok(())
    }

    /// Remove an agent from the primary map and every index entry.
    pub fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let (_, entry) = self
            .agents
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        for cap in &entry.descriptor.capabilities {
            if let Some(mut names) = self.by_capability.get_mut(cap) {
                names.retain(|n| n != name);
            }
        }
        tracing::info!(agent = name, "deregistered");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<AgentDescriptor, RegistryError> {
        self.agents
            .get(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn agent_impl(&self, name: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        self.agents
            .get(name)
            .map(|e| e.agent.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Enabled, currently-selectable descriptors claiming `tag`, in
    /// registration order.
    pub fn by_capability(&self, tag: &str) -> Vec<AgentDescriptor> {
        let tag = tag.to_lowercase();
        let names = match self.by_capability.get(&tag) {
            Some(names) => names.clone(),
            None => return Vec::new(),
        };
        names
            .iter()
            .filter_map(|n| self.agents.get(n))
            .filter(|e| e.descriptor.enabled && e.breaker.lock().is_selectable())
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Snapshot of all enabled descriptors, selectable or not.
    pub fn all_enabled(&self) -> Vec<AgentDescriptor> {
        self.agents
            .iter()
            .filter(|e| e.descriptor.enabled)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Whether `name` exists, is enabled, and its circuit admits selection.
    pub fn is_selectable(&self, name: &str) -> bool {
        self.agents
            .get(name)
            .map(|e| e.descriptor.enabled && e.breaker.lock().is_selectable())
            .unwrap_or(false)
    }

    /// Admit a call through the agent's circuit breaker, or fast-fail.
    pub fn acquire_circuit(&self, name: &str) -> Result<(), AgentError> {
        match self.agents.get(name) {
            Some(e) => e.breaker.lock().acquire(name),
            None => Err(AgentError::Failed(format!("agent '{}' not found", name))),
        }
    }

    /// Enforce the agent's per-minute rate limit before dispatch.
    pub fn check_rate_limit(&self, name: &str, now_unix: u64) -> Result<(), AgentError> {
        let entry = match self.agents.get(name) {
            Some(e) => e,
            None => return Ok(()),
        };
        let limit = match entry.descriptor.constraints.rate_limit_per_minute {
            Some(limit) if limit > 0 => limit,
            _ => return Ok(()),
        };
        let minute = now_unix / 60;
        let mut window = entry.rate_window.lock();
        if window.minute_epoch != minute {
            window.minute_epoch = minute;
            window.count = 0;
        }
        if window.count >= limit {
            let retry_after = Duration::from_secs(60 - (now_unix % 60));
            return Err(AgentError::RateLimited {
                agent: name.to_string(),
                retry_after,
            });
        }
        window.count += 1;
        Ok(())
    }

    /// Update health counters and feed the circuit breaker.
    pub fn record_outcome(&self, name: &str, success: bool, elapsed: Duration) {
        let entry = match self.agents.get(name) {
            Some(e) => e,
            None => return,
        };
        let calls = entry.call_count.fetch_add(1, Ordering::Relaxed) + 1;
        if success {
            entry.success_count.fetch_add(1, Ordering::Relaxed);
            entry.breaker.lock().record_success(name);
        } else {
            entry.failure_count.fetch_add(1, Ordering::Relaxed);
            entry.breaker.lock().record_failure(name);
        }
        let mut avg = entry.avg_execution_time_ms.lock();
        let sample = elapsed.as_secs_f64() * 1000.0;
        *avg += (sample - *avg) / calls as f64;
    }

    pub fn health_snapshot(&self, name: &str) -> Option<AgentHealthSnapshot> {
        self.agents.get(name).map(|e| {
            let breaker = e.breaker.lock();
            let circuit_state = breaker.state();
            AgentHealthSnapshot {
                call_count: e.call_count.load(Ordering::Relaxed),
                success_count: e.success_count.load(Ordering::Relaxed),
                failure_count: e.failure_count.load(Ordering::Relaxed),
                avg_execution_time_ms: *e.avg_execution_time_ms.lock(),
                is_healthy: circuit_state != crate::types::CircuitState::Open,
                circuit_state,
                open_until: breaker.open_until(),
            }
        })
    }

    /// Health for every registered agent, keyed by name.
    pub fn all_health(&self) -> Vec<(String, AgentHealthSnapshot)> {
        let names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|n| self.health_snapshot(&n).map(|h| (n, h)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
