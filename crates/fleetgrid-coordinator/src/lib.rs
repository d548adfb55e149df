//! fleetgrid-coordinator: agent registry, load balancing and task assignment.
//!
//! The coordinator:
//!
//! - Registers agents and tracks their health via heartbeats
//! - Ranks capable agents under one of five strategies
//! - Reserves resources and commits assignments durably, all or nothing
//! - Requeues work held by unhealthy or departed agents
//! - Rebalances `Assigned` tasks when load spread grows too wide
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!   ├── HybridState (agents, tasks, assignments, work streams)
//!   ├── ResourceManager (per-agent allocation ledgers)
//!   ├── AgentRegistry
//!   │   └── Per-agent slot (Agent + HeartbeatTracker + active tasks)
//!   └── RoundRobinCursors (one per capability class)
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod load_balancer;
pub mod maintenance;
pub mod metrics;
pub mod registry;
pub mod scoring;
pub mod strategy;

pub use config::{CoordinatorConfig, StrategyWeights};
pub use coordinator::{Coordinator, DispatchReport};
pub use error::{CoordinatorError, CoordinatorResult};
pub use health::{HealthVerdict, HeartbeatTracker};
pub use maintenance::{HealthSweep, Migration, RebalanceReport, RestoreReport};
pub use metrics::{CoordinatorMetrics, PoolMetrics};
pub use scoring::PerformanceScorer;
pub use strategy::Strategy;
