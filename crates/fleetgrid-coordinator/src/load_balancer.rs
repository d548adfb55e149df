//! Round-robin cursors.
//!
//! One cursor per capability class (the sorted set of capabilities a task
//! requires). A cursor stores the id of the agent that received the last
//! assignment for that class rather than an index, so the rotation stays
//! stable when agents join or leave.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use fleetgrid_state::AgentId;

/// Key of the cursor shared by tasks with the same required capabilities.
///
/// Each name is prefixed with its byte length, so names containing the
/// separator cannot collide with a different set.
pub fn capability_class(required: &BTreeSet<String>) -> String {
    required
        .iter()
        .map(|name| format!("{}:{name}", name.len()))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Default)]
pub struct RoundRobinCursors {
    cursors: Mutex<HashMap<String, AgentId>>,
}

impl RoundRobinCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent that received the last assignment for `class`.
    pub fn last(&self, class: &str) -> Option<AgentId> {
        self.cursors.lock().ok()?.get(class).cloned()
    }

    /// Record that `agent_id` received an assignment for `class`.
    pub fn advance(&self, class: &str, agent_id: &str) {
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.insert(class.to_string(), agent_id.to_string());
        }
    }
}
