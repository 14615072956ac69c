//! Per-user action history.
//!
//! An in-memory, append-only ring of `(category, timestamp, metadata)` per
//! user, supporting the time-window queries the policy evaluators need.
//! Retention is bounded both by a per-user cap and by age.

use crate::types::{ActionCategory, UserAction};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_actions_per_user")]
    pub max_actions_per_user: usize,
    #[serde(default = "default_max_history_days")]
    pub max_history_days: i64,
}

fn default_max_actions_per_user() -> usize {
    200
}

fn default_max_history_days() -> i64 {
    30
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_actions_per_user: default_max_actions_per_user(),
            max_history_days: default_max_history_days(),
        }
    }
}

/// Thread-safe per-user action ring. Writes and reads for one user go
/// through that user's map entry, so readers see a consistent snapshot.
pub struct ActionHistory {
    users: DashMap<String, VecDeque<UserAction>>,
    config: HistoryConfig,
}

impl ActionHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            users: DashMap::new(),
            config,
        }
    }

    /// Record an action stamped with the current time.
    pub fn record(
        &self,
        user_id: &str,
        category: ActionCategory,
        agent_names: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.record_action(UserAction {
            user_id: user_id.to_string(),
            category,
            timestamp: Utc::now(),
            agent_names,
            metadata,
        });
    }

    /// Record a fully-formed action (tests use explicit timestamps).
    pub fn record_action(&self, action: UserAction) {
        let mut ring = self.users.entry(action.user_id.clone()).or_default();
        ring.push_back(action);
        while ring.len() > self.config.max_actions_per_user {
            ring.pop_front();
        }
    }

    /// Actions for `user_id` at or after `since`, optionally restricted to
    /// a category set, oldest first.
    pub fn actions_since(
        &self,
        user_id: &str,
        categories: Option<&[ActionCategory]>,
        since: DateTime<Utc>,
    ) -> Vec<UserAction> {
        match self.users.get(user_id) {
            Some(ring) => ring
                .iter()
                .filter(|a| a.timestamp >= since)
                .filter(|a| categories.map_or(true, |cs| cs.contains(&a.category)))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn count(&self, user_id: &str, category: ActionCategory, since: DateTime<Utc>) -> usize {
        self.actions_since(user_id, Some(&[category]), since).len()
    }

    /// Most recent action of `category` for the user.
    pub fn last(&self, user_id: &str, category: ActionCategory) -> Option<UserAction> {
        self.users.get(user_id).and_then(|ring| {
            ring.iter()
                .rev()
                .find(|a| a.category == category)
                .cloned()
        })
    }

    /// Evict actions older than `max_history_days` and re-apply the
    /// per-user cap. Returns the number of evicted actions.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - Duration::days(self.config.max_history_days);
        let mut evicted = 0;
        for mut entry in self.users.iter_mut() {
            let before = entry.len();
            entry.retain(|a| a.timestamp >= cutoff);
            while entry.len() > self.config.max_actions_per_user {
                entry.pop_front();
            }
            evicted += before - entry.len();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "action history cleanup");
        }
        evicted
    }
}
