//! Coordinator error types.

use thiserror::Error;

use fleetgrid_resources::ResourceError;
use fleetgrid_state::{AgentId, StateError, TaskId, TaskStatus};

/// Errors returned by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("agent already registered: {0}")]
    DuplicateAgent(AgentId),

    #[error("agent registry full ({max} agents)")]
    CapacityExceeded { max: usize },

    #[error("no capable agent for task {0}")]
    NoCapableAgent(TaskId),

    #[error("no candidate agent has resources for task {0}")]
    ResourceExhausted(TaskId),

    #[error("agent is not healthy: {0}")]
    AgentUnhealthy(AgentId),

    #[error("state store unavailable: {0}")]
    StateStoreUnavailable(String),

    #[error("deadline exceeded during {0}")]
    Timeout(String),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is {status:?}, expected {expected}")]
    InvalidTaskState {
        task_id: TaskId,
        status: TaskStatus,
        expected: &'static str,
    },

    #[error("task {task_id} waits on unfinished dependencies: {pending:?}")]
    DependenciesUnmet { task_id: TaskId, pending: Vec<TaskId> },

    #[error("invalid coordinator config: {0}")]
    InvalidConfig(String),

    #[error("state error: {0}")]
    State(StateError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
}

impl From<StateError> for CoordinatorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Unavailable(what) => CoordinatorError::StateStoreUnavailable(what.to_string()),
            StateError::Timeout(op) => CoordinatorError::Timeout(op.to_string()),
            other => CoordinatorError::State(other),
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
