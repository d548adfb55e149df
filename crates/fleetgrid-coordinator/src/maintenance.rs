//! Periodic coordinator upkeep: health sweeps, load rebalancing, orphan
//! reconciliation and restart recovery.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetgrid_resources::{AllocationOutcome, ResourceError};
use fleetgrid_state::{AgentId, AgentStatus, TaskAssignment, TaskId, TaskStatus};

use crate::coordinator::Coordinator;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::health::HealthVerdict;
use crate::metrics::{CoordinatorMetrics, compute_metrics};
use crate::registry::{ActiveTask, AgentSlot};

/// Outcome of one health sweep.
#[derive(Debug, Default, Clone, Serialize)]
pub struct HealthSweep {
    pub checked: usize,
    pub unhealthy: Vec<AgentId>,
    pub offline: Vec<AgentId>,
    pub requeued: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Migration {
    pub task_id: TaskId,
    pub from: AgentId,
    pub to: AgentId,
    pub assignment: TaskAssignment,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RebalanceReport {
    /// Max minus min load across eligible agents before the pass.
    pub spread_before: f64,
    pub spread_after: f64,
    pub migrations: Vec<Migration>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RestoreReport {
    pub agents: usize,
    pub requeued: Vec<TaskId>,
}

impl Coordinator {
    // ── Health ─────────────────────────────────────────────────────

    /// Run one health check over every agent.
    ///
    /// Agents crossing the failure threshold become `Unhealthy` and give up
    /// their tasks; agents unhealthy past the offline grace are removed.
    pub async fn monitor_agent_health(&self) -> HealthSweep {
        let now = Instant::now();
        let grace = self.config.offline_grace;
        let mut sweep = HealthSweep::default();

        for (agent_id, slot_ref) in self.registry.slots().await {
            let mut slot = slot_ref.lock().await;
            if slot.removed {
                continue;
            }
            sweep.checked += 1;

            match slot.tracker.check(now, grace) {
                HealthVerdict::Alive | HealthVerdict::Missed(_) => {}
                HealthVerdict::BecameUnhealthy => {
                    slot.agent.status = AgentStatus::Unhealthy;
                    warn!(%agent_id, held = slot.active.len(), "agent unhealthy");
                    sweep.requeued.extend(self.evacuate(&mut slot).await);
                    self.persist_agent_quietly(&slot.agent).await;
                    sweep.unhealthy.push(agent_id);
                }
                HealthVerdict::StillUnhealthy => {
                    // An earlier evacuation may have stopped on a store error.
                    if !slot.active.is_empty() {
                        sweep.requeued.extend(self.evacuate(&mut slot).await);
                    }
                }
                HealthVerdict::Offline => {
                    slot.agent.status = AgentStatus::Offline;
                    sweep.offline.push(agent_id);
                }
            }
        }

        for agent_id in &sweep.offline {
            warn!(%agent_id, "agent offline, unregistering");
            match self.unregister_agent(agent_id).await {
                Ok(requeued) => sweep.requeued.extend(requeued),
                Err(e) => warn!(%agent_id, error = %e, "failed to unregister offline agent"),
            }
        }

        if !sweep.unhealthy.is_empty() || !sweep.offline.is_empty() {
            match self.reconcile().await {
                Ok(orphans) => sweep.requeued.extend(orphans),
                Err(e) => warn!(error = %e, "orphan reconciliation failed"),
            }
        }
        debug!(
            checked = sweep.checked,
            unhealthy = sweep.unhealthy.len(),
            offline = sweep.offline.len(),
            "health sweep finished"
        );
        sweep
    }

    async fn evacuate(&self, slot: &mut AgentSlot) -> Vec<TaskId> {
        match self.release_active(slot, "agent unhealthy").await {
            Ok(requeued) => requeued,
            Err(e) => {
                warn!(agent_id = %slot.agent.id, error = %e, "could not requeue tasks of unhealthy agent");
                Vec::new()
            }
        }
    }

    /// Run health sweeps every `health_check_interval` until shutdown.
    pub async fn run_health_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        // The first tick fires immediately; agents get one full interval.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.monitor_agent_health().await;
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    return;
                }
            }
        }
    }

    // ── Rebalancing ────────────────────────────────────────────────

    /// Move `Assigned` tasks from the most to the least loaded agents until
    /// the load spread is within `rebalance_threshold`.
    ///
    /// Running tasks are never moved.
    pub async fn rebalance_load(&self) -> CoordinatorResult<RebalanceReport> {
        let _guard = self.rebalance_lock.lock().await;
        let threshold = self.config.rebalance_threshold;

        let mut report = RebalanceReport {
            spread_before: self.load_spread().await,
            ..RebalanceReport::default()
        };
        // One migration per round; a round that moves nothing ends the pass.
        loop {
            if self.load_spread().await <= threshold {
                break;
            }
            match self.migrate_one().await? {
                Some(migration) => report.migrations.push(migration),
                None => break,
            }
        }
        report.spread_after = self.load_spread().await;
        if !report.migrations.is_empty() {
            info!(
                migrations = report.migrations.len(),
                spread_before = report.spread_before,
                spread_after = report.spread_after,
                "load rebalanced"
            );
        }
        Ok(report)
    }

    /// Eligible agents and their ledger utilization, most loaded first.
    async fn eligible_loads(&self) -> Vec<(AgentId, f64)> {
        let mut loads = Vec::new();
        for (agent, _) in self.registry.snapshot().await {
            if agent.status.is_eligible() {
                let load = self.resources.utilization(&agent.id).await.unwrap_or(0.0);
                loads.push((agent.id, load));
            }
        }
        loads.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        loads
    }

    async fn load_spread(&self) -> f64 {
        let loads = self.eligible_loads().await;
        match (loads.first(), loads.last()) {
            (Some(max), Some(min)) => max.1 - min.1,
            _ => 0.0,
        }
    }

    /// Migrate a single task off the most loaded agent that has a movable one.
    async fn migrate_one(&self) -> CoordinatorResult<Option<Migration>> {
        let loads = self.eligible_loads().await;
        for (source_id, source_load) in &loads {
            let Some(source_ref) = self.registry.get(source_id).await else {
                continue;
            };
            let held: Vec<(TaskId, ActiveTask)> = {
                let source = source_ref.lock().await;
                if !source.is_eligible() {
                    continue;
                }
                source.active.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            };

            for (task_id, active) in held {
                let Some(task) = self.state.get_task_state(&task_id).await? else {
                    continue;
                };
                if task.status != TaskStatus::Assigned || task.assigned_agent.as_deref() != Some(source_id.as_str()) {
                    continue;
                }

                // Least loaded capable target that would stay below the source.
                let mut targets: Vec<&(AgentId, f64)> = loads
                    .iter()
                    .filter(|(id, load)| id != source_id && *load < *source_load)
                    .collect();
                targets.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

                for (target_id, _) in targets {
                    if let Some(migration) = self
                        .migrate(&task_id, &active, source_id, target_id)
                        .await?
                    {
                        return Ok(Some(migration));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn migrate(
        &self,
        task_id: &str,
        active: &ActiveTask,
        source_id: &str,
        target_id: &str,
    ) -> CoordinatorResult<Option<Migration>> {
        let (Some(source_ref), Some(target_ref)) =
            (self.registry.get(source_id).await, self.registry.get(target_id).await)
        else {
            return Ok(None);
        };
        // Only rebalancing holds two slot locks, and it is serialized.
        let mut source = source_ref.lock().await;
        let mut target = target_ref.lock().await;
        if !source.is_eligible() || !target.is_eligible() || !source.active.contains_key(task_id) {
            return Ok(None);
        }

        let Some(task) = self.state.get_task_state(task_id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Assigned || !target.agent.has_capabilities(&task.required_capabilities) {
            return Ok(None);
        }

        // The move must leave the target strictly below the source's current
        // load, otherwise the next round would move it straight back.
        let (Some(source_totals), Some(target_totals)) = (
            self.resources.totals(source_id).await,
            self.resources.totals(target_id).await,
        ) else {
            return Ok(None);
        };
        let source_load = source_totals.max_ratio_of(&source.agent.capacity);
        let target_after = target_totals
            .add(&active.requirements)
            .max_ratio_of(&target.agent.capacity);
        if target_after >= source_load - 1e-9 {
            return Ok(None);
        }

        let allocation_id = match self
            .resources
            .allocate_resources(target_id, &active.requirements, None)
            .await
        {
            Ok(AllocationOutcome::Granted { allocation_id }) => allocation_id,
            Ok(AllocationOutcome::Denied { .. }) | Err(ResourceError::UnknownAgent(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let assignment = TaskAssignment::new(
            task_id,
            target_id,
            &allocation_id,
            "rebalance",
            self.config.estimated_task_duration.as_millis() as u64,
            (1.0 - target.agent.load).clamp(0.0, 1.0),
        );
        let committed = self
            .state
            .commit_assignment(
                &task,
                &assignment,
                Some(active.assignment_id.clone()),
                self.config.assignment_timeout,
            )
            .await;
        if let Err(e) = committed {
            self.release_allocation(target_id, &allocation_id).await;
            return match CoordinatorError::from(e) {
                e @ (CoordinatorError::StateStoreUnavailable(_) | CoordinatorError::Timeout(_)) => Err(e),
                e => {
                    debug!(%task_id, error = %e, "migration skipped");
                    Ok(None)
                }
            };
        }

        if let Some(previous) = source.active.remove(task_id) {
            self.release_allocation(source_id, &previous.allocation_id).await;
        }
        target.active.insert(
            task_id.to_string(),
            ActiveTask {
                allocation_id,
                assignment_id: assignment.id.clone(),
                requirements: active.requirements,
            },
        );
        self.refresh_load(&mut source).await;
        self.refresh_load(&mut target).await;
        self.persist_agent_quietly(&source.agent).await;
        self.persist_agent_quietly(&target.agent).await;

        warn!(%task_id, from = %source_id, to = %target_id, "task migrated");
        Ok(Some(Migration {
            task_id: task_id.to_string(),
            from: source_id.to_string(),
            to: target_id.to_string(),
            assignment,
        }))
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Return active tasks whose agent is gone or offline to `Pending`.
    pub async fn reconcile(&self) -> CoordinatorResult<Vec<TaskId>> {
        let mut requeued = Vec::new();
        for task in self.state.list_tasks().await? {
            if !task.status.is_active() {
                continue;
            }
            let Some(agent_id) = task.assigned_agent.clone() else {
                continue;
            };
            let owned = match self.registry.get(&agent_id).await {
                Some(slot_ref) => {
                    let slot = slot_ref.lock().await;
                    !slot.removed
                        && slot.agent.status != AgentStatus::Offline
                        && slot.active.contains_key(&task.id)
                }
                None => false,
            };
            if owned {
                continue;
            }

            if let Some(task) = self.state.requeue_task(&task.id, &agent_id).await? {
                warn!(task_id = %task.id, %agent_id, "orphaned task requeued");
                self.publish_pending(&task);
                requeued.push(task.id);
            }
        }
        Ok(requeued)
    }

    /// Rebuild the registry from the durable store after a restart.
    ///
    /// Non-offline agents come back `Idle` with a fresh health record;
    /// tasks that were in flight are requeued since their ledger entries
    /// did not survive.
    pub async fn restore(&self) -> CoordinatorResult<RestoreReport> {
        let mut report = RestoreReport::default();
        for mut agent in self.state.list_agents().await? {
            if agent.status == AgentStatus::Offline || self.registry.contains(&agent.id).await {
                continue;
            }
            if let Err(e) = self.registry.reserve(&agent.id).await {
                warn!(agent_id = %agent.id, error = %e, "agent not restored");
                continue;
            }
            agent.status = AgentStatus::Idle;
            agent.load = 0.0;

            match self.resources.register_capacity(&agent.id, agent.capacity).await {
                Ok(()) | Err(ResourceError::AlreadyRegistered(_)) => {}
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "agent not restored");
                    self.registry.release(&agent.id).await;
                    continue;
                }
            }
            self.registry
                .insert(AgentSlot::new(agent.clone(), self.config.failure_threshold))
                .await;
            self.persist_agent_quietly(&agent).await;
            report.agents += 1;
        }

        report.requeued = self.reconcile().await?;
        info!(agents = report.agents, requeued = report.requeued.len(), "registry restored");
        Ok(report)
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Per-pool load and queue depth.
    pub async fn metrics(&self) -> CoordinatorResult<CoordinatorMetrics> {
        let agents = self.registry.snapshot().await;
        let tasks = self.state.list_tasks().await?;
        Ok(compute_metrics(&agents, &tasks))
    }
}
