//! Resource manager: authoritative per-agent capacity accounting.
//!
//! Every agent has its own ledger behind its own mutex. An allocation
//! checks `totals + request <= capacity * safety_margin` in each dimension
//! and records the entry inside the same critical section, so concurrent
//! callers can never overcommit an agent. The outer map lock is only held
//! long enough to look a ledger up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetgrid_state::{AgentId, AllocationId, ResourceKind, ResourceSpec};

use crate::error::{ResourceError, ResourceResult};
use crate::metrics::{SystemMetrics, SystemSnapshot};

/// Slack for float comparison against the margin-scaled capacity.
const EPSILON: f64 = 1e-9;

/// Resource manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Fraction of declared capacity that may be allocated.
    pub safety_margin: f64,
    /// How often the reclamation sweep runs.
    #[serde(with = "humantime_serde")]
    pub reclamation_interval: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            safety_margin: 0.85,
            reclamation_interval: Duration::from_secs(60),
        }
    }
}

/// Why an allocation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    #[serde(rename = "InsufficientCPU")]
    InsufficientCpu,
    InsufficientMemory,
    InsufficientDisk,
    InsufficientNetwork,
}

impl From<ResourceKind> for DenialReason {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Cpu => DenialReason::InsufficientCpu,
            ResourceKind::Memory => DenialReason::InsufficientMemory,
            ResourceKind::Disk => DenialReason::InsufficientDisk,
            ResourceKind::Network => DenialReason::InsufficientNetwork,
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenialReason::InsufficientCpu => "InsufficientCPU",
            DenialReason::InsufficientMemory => "InsufficientMemory",
            DenialReason::InsufficientDisk => "InsufficientDisk",
            DenialReason::InsufficientNetwork => "InsufficientNetwork",
        };
        f.write_str(s)
    }
}

/// Result of an allocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    Granted { allocation_id: AllocationId },
    Denied { reason: DenialReason },
}

impl AllocationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AllocationOutcome::Granted { .. })
    }

    pub fn allocation_id(&self) -> Option<&str> {
        match self {
            AllocationOutcome::Granted { allocation_id } => Some(allocation_id),
            AllocationOutcome::Denied { .. } => None,
        }
    }
}

/// Usage of one agent in a [`CapacitySnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentUsage {
    pub capacity: ResourceSpec,
    pub allocated: ResourceSpec,
    /// Largest per-dimension allocated / capacity ratio.
    pub utilization: f64,
    pub entries: usize,
}

/// Fleet-wide capacity totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacitySnapshot {
    pub capacity: ResourceSpec,
    pub allocated: ResourceSpec,
    /// Unallocated share of the margin-scaled capacity in the tightest dimension.
    pub headroom_ratio: f64,
    pub agents: BTreeMap<AgentId, AgentUsage>,
}

/// What a reclamation pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub expired_entries: usize,
    pub orphaned_ledgers: usize,
}

#[derive(Debug)]
struct LedgerEntry {
    amount: ResourceSpec,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct AgentLedger {
    capacity: ResourceSpec,
    entries: HashMap<AllocationId, LedgerEntry>,
    totals: ResourceSpec,
    created_at: Instant,
}

impl AgentLedger {
    fn recompute_totals(&mut self) {
        self.totals = self
            .entries
            .values()
            .fold(ResourceSpec::ZERO, |acc, e| acc.add(&e.amount));
    }

    fn utilization(&self) -> f64 {
        self.totals.max_ratio_of(&self.capacity).min(1.0)
    }
}

/// Per-agent allocation ledger.
pub struct ResourceManager {
    ledgers: RwLock<HashMap<AgentId, Arc<Mutex<AgentLedger>>>>,
    config: ResourceConfig,
    metrics: Option<Arc<dyn SystemMetrics>>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            config,
            metrics: None,
        }
    }

    /// Attach the host metrics collaborator used by [`Self::get_system_resources`].
    pub fn with_metrics(mut self, metrics: Arc<dyn SystemMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    async fn ledger(&self, agent_id: &str) -> ResourceResult<Arc<Mutex<AgentLedger>>> {
        self.ledgers
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ResourceError::UnknownAgent(agent_id.to_string()))
    }

    /// Open a ledger for an agent with the given declared capacity.
    pub async fn register_capacity(&self, agent_id: &str, capacity: ResourceSpec) -> ResourceResult<()> {
        if !capacity.is_valid() {
            return Err(ResourceError::InvalidCapacity(format!("{capacity:?}")));
        }
        let mut ledgers = self.ledgers.write().await;
        if ledgers.contains_key(agent_id) {
            return Err(ResourceError::AlreadyRegistered(agent_id.to_string()));
        }
        ledgers.insert(
            agent_id.to_string(),
            Arc::new(Mutex::new(AgentLedger {
                capacity,
                entries: HashMap::new(),
                totals: ResourceSpec::ZERO,
                created_at: Instant::now(),
            })),
        );
        debug!(%agent_id, ?capacity, "ledger opened");
        Ok(())
    }

    /// Drop an agent's ledger, releasing every entry. Returns the released totals.
    pub async fn remove_agent(&self, agent_id: &str) -> Option<ResourceSpec> {
        let ledger = self.ledgers.write().await.remove(agent_id)?;
        let released = ledger.lock().await.totals;
        debug!(%agent_id, "ledger closed");
        Some(released)
    }

    /// Atomically check headroom and record an allocation.
    ///
    /// Dimensions are checked in cpu, memory, disk, network order; the
    /// first one that would exceed `capacity * safety_margin` is reported.
    pub async fn allocate_resources(
        &self,
        agent_id: &str,
        requirements: &ResourceSpec,
        ttl: Option<Duration>,
    ) -> ResourceResult<AllocationOutcome> {
        if !requirements.is_valid() {
            return Err(ResourceError::InvalidCapacity(format!("{requirements:?}")));
        }
        let ledger = self.ledger(agent_id).await?;
        let mut ledger = ledger.lock().await;

        let limit = ledger.capacity.scale(self.config.safety_margin);
        let proposed = ledger.totals.add(requirements);
        if let Some(kind) = ResourceKind::ALL
            .into_iter()
            .find(|k| proposed.get(*k) > limit.get(*k) + EPSILON)
        {
            let reason = DenialReason::from(kind);
            debug!(%agent_id, %reason, "allocation denied");
            return Ok(AllocationOutcome::Denied { reason });
        }

        let allocation_id = uuid::Uuid::new_v4().to_string();
        ledger.entries.insert(
            allocation_id.clone(),
            LedgerEntry {
                amount: *requirements,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        ledger.totals = proposed;
        debug!(%agent_id, %allocation_id, "allocation granted");
        Ok(AllocationOutcome::Granted { allocation_id })
    }

    /// Release one entry, or every entry when `allocation_id` is `None`.
    ///
    /// Releasing an unknown entry is a no-op. Returns the released amount.
    pub async fn deallocate_resources(
        &self,
        agent_id: &str,
        allocation_id: Option<&str>,
    ) -> ResourceResult<ResourceSpec> {
        let ledger = self.ledger(agent_id).await?;
        let mut ledger = ledger.lock().await;
        let released = match allocation_id {
            Some(id) => ledger
                .entries
                .remove(id)
                .map(|e| e.amount)
                .unwrap_or(ResourceSpec::ZERO),
            None => {
                let all = ledger.totals;
                ledger.entries.clear();
                all
            }
        };
        ledger.recompute_totals();
        debug!(%agent_id, ?allocation_id, "allocation released");
        Ok(released)
    }

    pub async fn totals(&self, agent_id: &str) -> Option<ResourceSpec> {
        let ledger = self.ledger(agent_id).await.ok()?;
        let totals = ledger.lock().await.totals;
        Some(totals)
    }

    /// Remaining allocatable amount: `capacity * margin - totals`.
    pub async fn headroom(&self, agent_id: &str) -> Option<ResourceSpec> {
        let ledger = self.ledger(agent_id).await.ok()?;
        let ledger = ledger.lock().await;
        Some(
            ledger
                .capacity
                .scale(self.config.safety_margin)
                .saturating_sub(&ledger.totals),
        )
    }

    /// Allocated fraction of declared capacity in the tightest dimension.
    pub async fn utilization(&self, agent_id: &str) -> Option<f64> {
        let ledger = self.ledger(agent_id).await.ok()?;
        let utilization = ledger.lock().await.utilization();
        Some(utilization)
    }

    pub async fn capacity_snapshot(&self) -> CapacitySnapshot {
        let ledgers: Vec<(AgentId, Arc<Mutex<AgentLedger>>)> = self
            .ledgers
            .read()
            .await
            .iter()
            .map(|(id, l)| (id.clone(), Arc::clone(l)))
            .collect();

        let mut capacity = ResourceSpec::ZERO;
        let mut allocated = ResourceSpec::ZERO;
        let mut agents = BTreeMap::new();
        for (id, ledger) in ledgers {
            let ledger = ledger.lock().await;
            capacity = capacity.add(&ledger.capacity);
            allocated = allocated.add(&ledger.totals);
            agents.insert(
                id,
                AgentUsage {
                    capacity: ledger.capacity,
                    allocated: ledger.totals,
                    utilization: ledger.utilization(),
                    entries: ledger.entries.len(),
                },
            );
        }

        let limit = capacity.scale(self.config.safety_margin);
        let headroom_ratio = if agents.is_empty() {
            0.0
        } else {
            (1.0 - allocated.max_ratio_of(&limit)).clamp(0.0, 1.0)
        };
        CapacitySnapshot {
            capacity,
            allocated,
            headroom_ratio,
            agents,
        }
    }

    /// Pass-through to the host metrics collaborator.
    pub async fn get_system_resources(&self) -> ResourceResult<SystemSnapshot> {
        let metrics = self.metrics.as_ref().ok_or(ResourceError::MetricsUnavailable)?;
        metrics
            .snapshot()
            .await
            .map_err(|e| ResourceError::Metrics(e.to_string()))
    }

    /// Remove expired entries and the ledgers of agents not in `live`.
    ///
    /// `as_of` is when `live` was captured; ledgers opened after that
    /// instant are left alone.
    pub async fn reclaim(&self, live: &HashSet<AgentId>, as_of: Instant) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        let orphaned: Vec<(AgentId, Arc<Mutex<AgentLedger>>)> = {
            let mut found = Vec::new();
            for (id, ledger) in self.ledgers.read().await.iter() {
                if !live.contains(id) && ledger.lock().await.created_at < as_of {
                    found.push((id.clone(), Arc::clone(ledger)));
                }
            }
            found
        };
        if !orphaned.is_empty() {
            let mut ledgers = self.ledgers.write().await;
            for (id, seen) in &orphaned {
                // A ledger re-opened since the scan is a different incarnation.
                if !ledgers.get(id).is_some_and(|current| Arc::ptr_eq(current, seen)) {
                    continue;
                }
                ledgers.remove(id);
                warn!(agent_id = %id, "reclaimed ledger of unregistered agent");
                report.orphaned_ledgers += 1;
            }
        }

        let remaining: Vec<(AgentId, Arc<Mutex<AgentLedger>>)> = self
            .ledgers
            .read()
            .await
            .iter()
            .map(|(id, l)| (id.clone(), Arc::clone(l)))
            .collect();
        let now = Instant::now();
        for (id, ledger) in remaining {
            let mut ledger = ledger.lock().await;
            let before = ledger.entries.len();
            ledger
                .entries
                .retain(|_, e| e.expires_at.is_none_or(|at| at > now));
            let expired = before - ledger.entries.len();
            if expired > 0 {
                ledger.recompute_totals();
                debug!(agent_id = %id, expired, "expired allocations reclaimed");
                report.expired_entries += expired;
            }
        }
        report
    }

    /// Periodic reclamation until shutdown.
    ///
    /// `live_agents` carries the current registry membership.
    pub async fn run_reclamation(
        self: Arc<Self>,
        live_agents: watch::Receiver<HashSet<AgentId>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.config.reclamation_interval);
        info!(
            interval = ?self.config.reclamation_interval,
            "resource reclamation started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let as_of = Instant::now();
                    let live = live_agents.borrow().clone();
                    let report = self.reclaim(&live, as_of).await;
                    if report != ReclaimReport::default() {
                        info!(
                            expired = report.expired_entries,
                            orphaned = report.orphaned_ledgers,
                            "reclamation pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource reclamation shutting down");
                    break;
                }
            }
        }
    }
}
