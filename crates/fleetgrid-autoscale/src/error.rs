//! Scaling error types.

use std::time::Duration;

use thiserror::Error;

use fleetgrid_coordinator::CoordinatorError;

use crate::policy::ScaleAction;

#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("{action:?} for {agent_type} blocked by cooldown ({remaining:?} left)")]
    CooldownViolation {
        agent_type: String,
        action: ScaleAction,
        remaining: Duration,
    },

    #[error("no scaling policy for agent type {0}")]
    UnknownAgentType(String),

    #[error("invalid scaling policy: {0}")]
    InvalidPolicy(String),

    #[error("lifecycle operation failed: {0}")]
    Lifecycle(String),

    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

pub type ScalingResult<T> = Result<T, ScalingError>;
