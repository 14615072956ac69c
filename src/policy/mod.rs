//! Policy layer: action categories, per-user history, and the evaluator
//! chain that gates execution.

pub mod evaluators;
pub mod history;

pub use evaluators::{Evaluator, EvaluatorEntry, EvaluatorRegistry, EvaluatorSpec, PolicyDecision};
pub use history::{ActionHistory, HistoryConfig};

use crate::types::{ActionCategory, QueryRequest};
use regex::Regex;

/// Maps a request onto an [`ActionCategory`] with an ordered keyword table
/// over the query text. An explicit `category` field wins; anything the
/// table does not recognize maps to `Other`.
pub struct CategoryClassifier {
    table: Vec<(Regex, ActionCategory)>,
}

impl Default for CategoryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryClassifier {
    pub fn new() -> Self {
        // Order matters: "order a new card" must classify as a card order,
        // not a generic purchase.
        let entries: &[(&str, ActionCategory)] = &[
            (r"\baddress\b", ActionCategory::AddressChange),
            (r"\bpayment method\b|\bpayment\b", ActionCategory::PaymentMethodChange),
            (r"\bpassword\b|\bpasscode\b", ActionCategory::PasswordChange),
            (r"\bcard\b", ActionCategory::CardOrder),
            (r"\bclose\b.*\baccount\b|\baccount closure\b", ActionCategory::AccountClosure),
            (r"\btransfer\b|\bsend money\b|\bwire\b", ActionCategory::Transfer),
            (r"\bbuy\b|\bpurchase\b|\border\b", ActionCategory::Purchase),
            (
                r"\bwhat\b|\bhow\b|\bwho\b|\bwhen\b|\bsearch\b|\bfind\b|\bcalculate\b|\bweather\b|\blook up\b",
                ActionCategory::Query,
            ),
        ];
        let table = entries
            .iter()
            .map(|(pattern, category)| {
                (
                    Regex::new(pattern).expect("built-in category pattern"),
                    *category,
                )
            })
            .collect();
        Self { table }
    }

    pub fn classify(&self, request: &QueryRequest) -> ActionCategory {
        if let Some(explicit) = request
            .fields
            .get("category")
            .or_else(|| request.metadata.get("category"))
        {
            if let Ok(category) = serde_json::from_value::<ActionCategory>(explicit.clone()) {
                return category;
            }
        }
        let query = request.query.to_lowercase();
        for (pattern, category) in &self.table {
            if pattern.is_match(&query) {
                return *category;
            }
        }
        ActionCategory::Other
    }
}
