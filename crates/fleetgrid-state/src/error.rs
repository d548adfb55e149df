//! Error types for the FleetGrid state layer.

use thiserror::Error;

/// Result type alias for state layer operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur in the durable store, cache, or work queue.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("invalid task transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: crate::types::TaskStatus,
        to: crate::types::TaskStatus,
    },

    #[error("{0} unavailable (circuit open)")]
    Unavailable(&'static str),

    #[error("deadline exceeded during {0}")]
    Timeout(&'static str),

    #[error("cache error: {0}")]
    Cache(String),
}

impl StateError {
    /// Whether retrying the same call may succeed.
    ///
    /// Storage-engine failures are transient; logical failures (missing or
    /// duplicate keys, bad transitions, bad payloads) are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Cache(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_are_transient() {
        assert!(StateError::Write("disk".into()).is_transient());
        assert!(StateError::Transaction("busy".into()).is_transient());
        assert!(StateError::Cache("conn reset".into()).is_transient());
    }

    #[test]
    fn logical_failures_are_not_transient() {
        assert!(!StateError::Duplicate("agent:a".into()).is_transient());
        assert!(!StateError::Conflict("task:t".into()).is_transient());
        assert!(!StateError::Unavailable("durable store").is_transient());
        assert!(!StateError::Deserialize("bad json".into()).is_transient());
    }
}
