//! Per-agent circuit breaker.
//!
//! Fast-fails calls to agents that keep failing, and excludes them from
//! selection while the circuit is open. Standard Closed → Open → Half-Open
//! state machine driven by consecutive failures.

use crate::types::{AgentError, CircuitState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    #[serde(default = "default_cool_down", with = "humantime_serde")]
    pub cool_down: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down: default_cool_down(),
        }
    }
}

#[derive(Debug, Clone)]
enum State {
    Closed,
    Open { open_until: Instant },
    /// One probe request is admitted; `probe_in_flight` guards against
    /// concurrent requests racing into the same half-open window.
    HalfOpen { probe_in_flight: bool },
}

/// Circuit breaker for a single agent.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: State,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: State::Closed,
            consecutive_failures: 0,
        }
    }

    /// Whether selection may include this agent right now. An expired open
    /// circuit transitions to half-open and becomes selectable again.
    pub fn is_selectable(&mut self) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { open_until } => {
                if Instant::now() >= open_until {
                    self.state = State::HalfOpen {
                        probe_in_flight: false,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_in_flight } => !probe_in_flight,
        }
    }

    /// Admit a call, or fast-fail with `CircuitOpen`.
    pub fn acquire(&mut self, agent: &str) -> Result<(), AgentError> {
        match self.state {
            State::Closed => Ok(()),
            State::Open { open_until } => {
                let now = Instant::now();
                if now >= open_until {
                    self.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    tracing::info!(agent, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(AgentError::CircuitOpen {
                        agent: agent.to_string(),
                        retry_in: open_until - now,
                    })
                }
            }
            State::HalfOpen {
                ref mut probe_in_flight,
            } => {
                if *probe_in_flight {
                    Err(AgentError::CircuitOpen {
                        agent: agent.to_string(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&mut self, agent: &str) {
        if matches!(self.state, State::HalfOpen { .. }) {
            tracing::info!(agent, "circuit recovered, closing");
        }
        self.state = State::Closed;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, agent: &str) {
        match self.state {
            State::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(agent);
                }
            }
            State::HalfOpen { .. } => {
                // Probe failed; re-open and extend the cool-down.
                self.consecutive_failures += 1;
                self.trip(agent);
            }
            State::Open { .. } => {
                self.consecutive_failures += 1;
            }
        }
    }

    fn trip(&mut self, agent: &str) {
        self.state = State::Open {
            open_until: Instant::now() + self.config.cool_down,
        };
        tracing::warn!(
            agent,
            consecutive_failures = self.consecutive_failures,
            cool_down_secs = self.config.cool_down.as_secs(),
            "circuit tripped open"
        );
    }

    pub fn state(&self) -> CircuitState {
        match self.state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Wall-clock time at which an open circuit admits its next probe.
    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        match self.state {
            State::Open { open_until } => {
                let remaining = open_until.saturating_duration_since(Instant::now());
                Some(Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_default())
            }
            _ => None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
