//! conductor: a policy-aware multi-agent request orchestrator.
//!
//! Given a structured query, the orchestrator selects registered agents by
//! declared capability (rules first, validated or overridden by a reasoning
//! service), enforces per-user policy, executes the agents with retry,
//! fallback, and circuit breaking, validates their outputs for structure,
//! consistency, and hallucination, and answers with a single consolidated
//! response backed by a complete per-query audit log.
//!
//! The [`pipeline::Orchestrator`] value owns every subsystem; build one
//! from a [`config::ConfigBundle`] and either embed it or serve it over
//! HTTP with [`api::ApiServer`].

pub mod api;
pub mod audit;
pub mod config;
pub mod exec;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod reasoning;
pub mod registry;
pub mod routing;
pub mod types;
pub mod validation;

pub use api::ApiServer;
pub use config::{ConfigBundle, ConfigPaths, OrchestratorConfig};
pub use pipeline::{
    ConversationalWrapper, Orchestrator, OrchestratorBuilder, PipelineEvent, PipelineResponse,
    ResponseDecorator,
};
pub use registry::{Agent, CapabilityRegistry, InvocationContext};
pub use types::*;
