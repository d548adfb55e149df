//! Domain types for the FleetGrid state layer.
//!
//! These types represent the persisted state of agents, tasks, assignments,
//! and allocation totals. All types are serializable to/from JSON for
//! storage in redb tables and in the cache tier.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for an agent.
pub type AgentId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for a resource ledger entry.
pub type AllocationId = String;

// ── Resources ─────────────────────────────────────────────────────

/// One dimension of an agent's compute capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quantity across all four resource dimensions.
///
/// Used both for declared agent capacity and for task requirements.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub network_mbps: f64,
}

impl ResourceSpec {
    pub const ZERO: ResourceSpec = ResourceSpec {
        cpu_cores: 0.0,
        memory_mb: 0.0,
        disk_mb: 0.0,
        network_mbps: 0.0,
    };

    pub fn new(cpu_cores: f64, memory_mb: f64, disk_mb: f64, network_mbps: f64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_mb,
            network_mbps,
        }
    }

    /// Amount in a single dimension.
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_cores,
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Disk => self.disk_mb,
            ResourceKind::Network => self.network_mbps,
        }
    }

    fn zip_with(&self, other: &ResourceSpec, f: impl Fn(f64, f64) -> f64) -> ResourceSpec {
        ResourceSpec {
            cpu_cores: f(self.cpu_cores, other.cpu_cores),
            memory_mb: f(self.memory_mb, other.memory_mb),
            disk_mb: f(self.disk_mb, other.disk_mb),
            network_mbps: f(self.network_mbps, other.network_mbps),
        }
    }

    pub fn add(&self, other: &ResourceSpec) -> ResourceSpec {
        self.zip_with(other, |a, b| a + b)
    }

    /// Per-dimension subtraction floored at zero.
    pub fn saturating_sub(&self, other: &ResourceSpec) -> ResourceSpec {
        self.zip_with(other, |a, b| (a - b).max(0.0))
    }

    pub fn scale(&self, factor: f64) -> ResourceSpec {
        self.zip_with(&ResourceSpec::ZERO, |a, _| a * factor)
    }

    /// True when every dimension is non-negative and finite.
    pub fn is_valid(&self) -> bool {
        ResourceKind::ALL
            .iter()
            .all(|k| self.get(*k).is_finite() && self.get(*k) >= 0.0)
    }

    pub fn is_zero(&self) -> bool {
        ResourceKind::ALL.iter().all(|k| self.get(*k) == 0.0)
    }

    /// Largest per-dimension ratio of `self` to `capacity`.
    ///
    /// Dimensions with zero capacity are ignored unless `self` asks for
    /// some of them, in which case the ratio is infinite.
    pub fn max_ratio_of(&self, capacity: &ResourceSpec) -> f64 {
        ResourceKind::ALL
            .iter()
            .map(|k| {
                let want = self.get(*k);
                let have = capacity.get(*k);
                if have > 0.0 {
                    want / have
                } else if want > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                }
            })
            .fold(0.0, f64::max)
    }
}

// ── Agent ─────────────────────────────────────────────────────────

/// Health/activity status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Unhealthy,
    Offline,
}

impl AgentStatus {
    /// Whether agents in this status may receive new tasks.
    pub fn is_eligible(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

/// A worker agent as recorded in the registry and the `agents` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    /// Pool the agent belongs to; scaling policies and work streams are keyed by it.
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Fraction of declared capacity currently allocated (0.0–1.0).
    pub load: f64,
    /// Unix epoch milliseconds of the last heartbeat.
    pub last_heartbeat: u64,
    pub capacity: ResourceSpec,
    /// Rolling task success rate (0.0–1.0), neutral 0.5 until observed.
    pub performance: f64,
    pub registered_at: u64,
}

impl Agent {
    pub fn new<I, S>(id: &str, agent_type: &str, capabilities: I, capacity: ResourceSpec) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = epoch_millis();
        Self {
            id: id.to_string(),
            agent_type: agent_type.to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Idle,
            load: 0.0,
            last_heartbeat: now,
            capacity,
            performance: 0.5,
            registered_at: now,
        }
    }

    /// Whether this agent advertises every capability in `required`.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Number of advertised capabilities not in `required`.
    pub fn extra_capabilities(&self, required: &BTreeSet<String>) -> usize {
        self.capabilities.difference(required).count()
    }

    pub fn cache_key(&self) -> String {
        agent_key(&self.id)
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Assigned or running: the task holds an agent and a ledger entry.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A unit of work submitted by an external producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    /// Higher is more urgent.
    pub priority: i32,
    pub requirements: ResourceSpec,
    pub required_capabilities: BTreeSet<String>,
    /// Tasks that must be `Completed` before this one may be assigned.
    pub dependencies: Vec<TaskId>,
    /// Optional unix epoch milliseconds by which the task should finish.
    pub deadline: Option<u64>,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    /// Id of the `TaskAssignment` currently in force.
    pub assignment_ref: Option<String>,
    /// Number of failed executions so far.
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Task {
    pub fn new(id: &str, task_type: &str, priority: i32) -> Self {
        let now = epoch_millis();
        Self {
            id: id.to_string(),
            task_type: task_type.to_string(),
            priority,
            requirements: ResourceSpec::ZERO,
            required_capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            deadline: None,
            status: TaskStatus::Pending,
            assigned_agent: None,
            assignment_ref: None,
            attempts: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_requirements(mut self, requirements: ResourceSpec) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the state machine permits moving from the current status to `to`.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self.status, to) {
            (Pending, Assigned) => true,
            (Assigned, Running) | (Assigned, Pending) | (Assigned, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, Pending) => true,
            (Failed, Pending) => self.attempts < self.max_retries,
            _ => false,
        }
    }

    /// Apply a status transition, rejecting moves the state machine forbids.
    ///
    /// Moving back to `Pending` clears the agent binding.
    pub fn transition(&mut self, to: TaskStatus) -> StateResult<()> {
        if !self.can_transition(to) {
            return Err(StateError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to == TaskStatus::Pending {
            self.assigned_agent = None;
            self.assignment_ref = None;
        }
        self.updated_at = epoch_millis();
        Ok(())
    }

    pub fn cache_key(&self) -> String {
        task_key(&self.id)
    }
}

// ── Assignment ────────────────────────────────────────────────────

/// Immutable record binding a task to an agent.
///
/// A reassignment writes a new record; the task's `assignment_ref`
/// points at whichever one is current.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub id: String,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub allocation_id: AllocationId,
    /// Name of the strategy that produced this assignment.
    pub strategy: String,
    pub assigned_at: u64,
    pub estimated_completion: u64,
    /// Strategy fitness normalized to [0, 1].
    pub confidence: f64,
}

impl TaskAssignment {
    pub fn new(
        task_id: &str,
        agent_id: &str,
        allocation_id: &str,
        strategy: &str,
        estimated_duration_ms: u64,
        confidence: f64,
    ) -> Self {
        let now = epoch_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            allocation_id: allocation_id.to_string(),
            strategy: strategy.to_string(),
            assigned_at: now,
            estimated_completion: now + estimated_duration_ms,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Build the composite key for the assignments table.
    ///
    /// Zero-padding the timestamp keeps a task's records in time order.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.task_id, self.assigned_at, self.id)
    }
}

// ── Allocations ───────────────────────────────────────────────────

/// Total amount of one resource currently allocated on an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationRecord {
    pub agent_id: AgentId,
    pub resource: ResourceKind,
    pub amount: f64,
    pub updated_at: u64,
}

impl AllocationRecord {
    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.resource)
    }

    /// One record per resource dimension from a per-agent total.
    pub fn from_totals(agent_id: &str, totals: &ResourceSpec) -> Vec<AllocationRecord> {
        let now = epoch_millis();
        ResourceKind::ALL
            .iter()
            .map(|kind| AllocationRecord {
                agent_id: agent_id.to_string(),
                resource: *kind,
                amount: totals.get(*kind),
                updated_at: now,
            })
            .collect()
    }
}

// ── Keys ──────────────────────────────────────────────────────────

/// Cache key for an agent record.
pub fn agent_key(id: &str) -> String {
    format!("agent:{id}")
}

/// Cache key for a task record.
pub fn task_key(id: &str) -> String {
    format!("task:{id}")
}

/// Work stream for tasks destined to a pool of agents.
pub fn pending_stream_key(agent_type: &str) -> String {
    format!("tasks:pending:{agent_type}")
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
