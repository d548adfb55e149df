//! redb table definitions for the FleetGrid durable store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child}`.

use redb::TableDefinition;

/// Agent records keyed by `{agent_id}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Task records keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Assignment history keyed by `{task_id}:{assigned_at}:{assignment_id}`.
pub const ASSIGNMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("assignments");

/// Allocation totals keyed by `{agent_id}:{resource_type}`.
pub const ALLOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocations");
