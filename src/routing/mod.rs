//! Agent selection: the declarative rule engine and the hybrid policy that
//! combines it with the reasoning client.

pub mod hybrid;
pub mod rules;

pub use hybrid::{HybridConfig, HybridReasoner, ReasoningMode, SelectionOutcome};
pub use rules::{Rule, RuleCondition, RuleEngine, RuleMatch};
