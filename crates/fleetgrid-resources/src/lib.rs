//! fleetgrid-resources: capacity accounting for FleetGrid agents.
//!
//! The [`ResourceManager`] keeps one allocation ledger per agent and
//! guarantees that, per resource dimension, the sum of live allocations
//! never exceeds the agent's declared capacity times the safety margin.
//! It knows agents only by id; the coordinator owns the agents themselves.

pub mod error;
pub mod manager;
pub mod metrics;

pub use error::{ResourceError, ResourceResult};
pub use manager::{
    AgentUsage, AllocationOutcome, CapacitySnapshot, DenialReason, ReclaimReport, ResourceConfig,
    ResourceManager,
};
pub use metrics::{StaticMetrics, SystemMetrics, SystemSnapshot};
