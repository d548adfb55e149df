//! fleetgrid-autoscale: load-driven agent pool sizing.
//!
//! Reads pool metrics from the coordinator, compares them against each
//! agent type's `ScalingPolicy` and asks an external lifecycle
//! collaborator to start or stop agents.
//!
//! # Scaling Algorithm
//!
//! ```text
//! breach up   = avg_load > scale_up_threshold
//!               or pending per agent > queue_depth_threshold
//!               or count < min_instances
//! breach down = avg_load < scale_down_threshold and no pending work
//!               or count > max_instances
//!
//! after 2 consecutive breaches in the same direction:
//!     up:   target = clamp(ceil(count * scale_factor))
//!     down: target = max(clamp(floor(count / scale_factor)), busy agents)
//! ```
//!
//! A decision in the same direction as one fired within `cooldown` is
//! suppressed; so is a scale-up while the state layer is degraded. A
//! failed lifecycle call is retried once, then escalated.

pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod scaler;

pub use error::{ScalingError, ScalingResult};
pub use lifecycle::AgentLifecycle;
pub use policy::{DecisionStatus, ScaleAction, ScalingConfig, ScalingDecision, ScalingPolicy};
pub use scaler::{STABILITY_CYCLES, ScalingManager};
