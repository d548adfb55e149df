//! fleetgrid-state: hybrid state layer for FleetGrid.
//!
//! Presents one interface ([`HybridState`]) over three tiers:
//!
//! ```text
//!            ┌──────────────── HybridState ────────────────┐
//!  reads ──▶ │ cache (TTL) ──miss──▶ durable store (redb)  │
//!  writes ─▶ │ durable store ──commit──▶ cache overwrite   │
//!  queue ──▶ │ task streams + consumer groups              │
//!            └─────────────────────────────────────────────┘
//! ```
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{task_id}:{assigned_at}:{id}`, `{agent_id}:{resource}`)
//! enable prefix scans for related records. Cache keys are `agent:{id}` and
//! `task:{id}`; work streams are `tasks:pending:{agent_type}`.
//!
//! Calls into the durable store and the cache are each wrapped by a
//! [`CircuitBreaker`]. `HybridState` is `Clone` (backed by `Arc`) and can be
//! shared across async tasks.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod hybrid;
pub mod latency;
pub mod queue;
pub mod store;
pub mod tables;
pub mod types;

pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::{CacheBackend, MemoryCache};
pub use error::{StateError, StateResult};
pub use hybrid::{HybridState, StateConfig, StateHealthReport, StoreStatus};
pub use queue::{Delivery, EntryId, GroupStatus, QueueStatus, TaskQueue};
pub use store::{DurableStore, StateStore};
pub use types::*;
