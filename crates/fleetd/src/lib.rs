//! fleetd: the FleetGrid daemon.
//!
//! Loads `fleetd.toml`, opens the redb-backed state layer and runs:
//! - agent health monitoring
//! - pending-task dispatch and rebalancing
//! - resource reclamation
//! - pool autoscaling
//! - finished-task retention

pub mod config;
pub mod daemon;
pub mod lifecycle;

pub use config::{ConfigError, DaemonConfig, FleetConfig, LifecycleConfig};
pub use daemon::Fleet;
pub use lifecycle::CommandLifecycle;
