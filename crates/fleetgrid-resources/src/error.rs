//! Error types for the resource manager.

use thiserror::Error;

/// Result type alias for resource manager operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Failures of the ledger itself. An allocation that does not fit is not an
/// error; it is reported as [`crate::AllocationOutcome::Denied`].
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no ledger for agent: {0}")]
    UnknownAgent(String),

    #[error("ledger already exists for agent: {0}")]
    AlreadyRegistered(String),

    #[error("invalid resource amounts: {0}")]
    InvalidCapacity(String),

    #[error("no system metrics source configured")]
    MetricsUnavailable,

    #[error("system metrics error: {0}")]
    Metrics(String),
}
