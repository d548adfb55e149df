//! The agent coordinator.
//!
//! Owns the agent registry and drives task assignment: candidate
//! filtering, strategy ranking, resource allocation and the durable
//! commit. Health monitoring and rebalancing live in `maintenance.rs`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetgrid_resources::{AllocationOutcome, ResourceError, ResourceManager};
use fleetgrid_state::{
    Agent, AgentId, AgentStatus, HybridState, ResourceSpec, StateError, Task, TaskAssignment,
    TaskId, TaskStatus, epoch_millis,
};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::load_balancer::{RoundRobinCursors, capability_class};
use crate::registry::{ActiveTask, AgentRegistry, AgentSlot, SlotRef};
use crate::scoring::{PerformanceScorer, update_performance};
use crate::strategy::{Candidate, Ranked, Strategy, rank};

/// Result of one [`Coordinator::dispatch_pending`] pass.
#[derive(Debug, Default, Serialize)]
pub struct DispatchReport {
    pub assigned: Vec<TaskAssignment>,
    /// Tasks left pending, with the reason.
    pub skipped: Vec<(TaskId, String)>,
    /// The pass stopped early because the state store is unavailable.
    pub halted: bool,
}

/// Where an assignment may go.
enum Target<'a> {
    Strategy(Strategy),
    Pinned(&'a str),
}

pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) state: HybridState,
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) registry: AgentRegistry,
    cursors: RoundRobinCursors,
    scorer: Option<Arc<dyn PerformanceScorer>>,
    permits: Semaphore,
    pub(crate) rebalance_lock: Mutex<()>,
}

/// Run `fut`, failing with [`CoordinatorError::Timeout`] at `deadline_at`.
pub(crate) async fn within<T, F>(deadline_at: Instant, what: &str, fut: F) -> CoordinatorResult<T>
where
    F: Future<Output = CoordinatorResult<T>>,
{
    match tokio::time::timeout_at(deadline_at, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoordinatorError::Timeout(what.to_string())),
    }
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        state: HybridState,
        resources: Arc<ResourceManager>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        Ok(Self {
            registry: AgentRegistry::new(config.max_agents),
            permits: Semaphore::new(config.max_concurrent_assignments),
            cursors: RoundRobinCursors::new(),
            scorer: None,
            rebalance_lock: Mutex::new(()),
            config,
            state,
            resources,
        })
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn PerformanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state(&self) -> &HybridState {
        &self.state
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Ids of registered agents, updated on every registration change.
    pub fn live_agents(&self) -> watch::Receiver<std::collections::HashSet<AgentId>> {
        self.registry.subscribe()
    }

    // ── Registration ───────────────────────────────────────────────

    /// Add an agent to the registry, persist it and open its ledger.
    ///
    /// The agent starts `Idle` with zero load regardless of what the
    /// caller passed in.
    pub async fn register_agent(&self, agent: Agent) -> CoordinatorResult<Agent> {
        if !agent.capacity.is_valid() {
            return Err(ResourceError::InvalidCapacity(format!("{:?}", agent.capacity)).into());
        }
        self.registry.reserve(&agent.id).await?;

        let mut agent = agent;
        let now = epoch_millis();
        agent.status = AgentStatus::Idle;
        agent.load = 0.0;
        agent.last_heartbeat = now;
        agent.registered_at = now;

        if let Err(e) = self.persist_new_agent(&agent).await {
            self.registry.release(&agent.id).await;
            return Err(e);
        }

        match self.resources.register_capacity(&agent.id, agent.capacity).await {
            Ok(()) => {}
            Err(ResourceError::AlreadyRegistered(_)) => {
                // Ledger left over from an earlier incarnation.
                self.resources.remove_agent(&agent.id).await;
                self.resources.register_capacity(&agent.id, agent.capacity).await?;
            }
            Err(e) => {
                self.registry.release(&agent.id).await;
                return Err(e.into());
            }
        }

        self.registry
            .insert(AgentSlot::new(agent.clone(), self.config.failure_threshold))
            .await;
        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            capabilities = ?agent.capabilities,
            "agent registered"
        );
        Ok(agent)
    }

    async fn persist_new_agent(&self, agent: &Agent) -> CoordinatorResult<()> {
        match self.state.register_agent(agent).await {
            Ok(()) => Ok(()),
            Err(StateError::Duplicate(_)) => {
                debug!(agent_id = %agent.id, "replacing stale durable agent record");
                Ok(self.state.set_agent_state(agent).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an agent. Its unfinished tasks go back to `Pending`; their ids
    /// are returned.
    pub async fn unregister_agent(&self, agent_id: &str) -> CoordinatorResult<Vec<TaskId>> {
        let slot_ref = self.slot(agent_id).await?;
        let mut slot = slot_ref.lock().await;
        if slot.removed {
            return Err(CoordinatorError::AgentNotFound(agent_id.to_string()));
        }

        let requeued = self.release_active(&mut slot, "agent unregistered").await?;
        self.state.delete_agent(agent_id).await?;
        slot.removed = true;
        drop(slot);

        self.registry.remove(agent_id).await;
        self.resources.remove_agent(agent_id).await;
        info!(%agent_id, requeued = requeued.len(), "agent unregistered");
        Ok(requeued)
    }

    // ── Heartbeats and queries ─────────────────────────────────────

    /// Record a heartbeat. An unhealthy agent recovers immediately.
    pub async fn heartbeat(&self, agent_id: &str) -> CoordinatorResult<AgentStatus> {
        let slot_ref = self.slot(agent_id).await?;
        let mut slot = slot_ref.lock().await;
        if slot.removed {
            return Err(CoordinatorError::AgentNotFound(agent_id.to_string()));
        }

        slot.agent.last_heartbeat = epoch_millis();
        if slot.tracker.record_heartbeat() {
            slot.agent.status = if slot.active.is_empty() {
                AgentStatus::Idle
            } else {
                AgentStatus::Busy
            };
            info!(%agent_id, "agent healthy again");
        }
        if let Err(e) = self.state.set_agent_state(&slot.agent).await {
            debug!(%agent_id, error = %e, "heartbeat not persisted");
        }
        Ok(slot.agent.status)
    }

    /// Stop routing work to an idle agent ahead of its termination.
    ///
    /// Returns `false`, and leaves the agent in service, if it holds tasks
    /// or is not `Idle`.
    pub async fn drain_agent(&self, agent_id: &str) -> CoordinatorResult<bool> {
        let slot_ref = self.slot(agent_id).await?;
        let mut slot = slot_ref.lock().await;
        if slot.removed {
            return Err(CoordinatorError::AgentNotFound(agent_id.to_string()));
        }
        if !slot.active.is_empty() || slot.agent.status != AgentStatus::Idle {
            slot.draining = false;
            return Ok(false);
        }
        slot.draining = true;
        debug!(%agent_id, "agent draining");
        Ok(true)
    }

    /// Put a drained agent back in service.
    pub async fn undrain_agent(&self, agent_id: &str) -> CoordinatorResult<()> {
        let slot_ref = self.slot(agent_id).await?;
        slot_ref.lock().await.draining = false;
        Ok(())
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> CoordinatorResult<Agent> {
        let slot_ref = self.slot(agent_id).await?;
        let slot = slot_ref.lock().await;
        if slot.removed {
            return Err(CoordinatorError::AgentNotFound(agent_id.to_string()));
        }
        Ok(slot.agent.clone())
    }

    /// Registered agents, sorted by id.
    pub async fn list_agents(&self) -> Vec<Agent> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .map(|(agent, _)| agent)
            .collect()
    }

    /// Ids of the unfinished tasks an agent holds.
    pub async fn active_tasks(&self, agent_id: &str) -> CoordinatorResult<Vec<TaskId>> {
        let slot_ref = self.slot(agent_id).await?;
        let slot = slot_ref.lock().await;
        Ok(slot.active.keys().cloned().collect())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Record a new task as `Pending` and publish it to its pool's stream.
    pub async fn submit_task(&self, task: Task) -> CoordinatorResult<Task> {
        if !task.requirements.is_valid() {
            return Err(ResourceError::InvalidCapacity(format!("{:?}", task.requirements)).into());
        }
        if self.state.get_task_state(&task.id).await?.is_some() {
            return Err(StateError::Duplicate(format!("task {}", task.id)).into());
        }

        let mut task = task;
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.assignment_ref = None;
        task.updated_at = epoch_millis();
        self.state.set_task_state(&task).await?;
        self.publish_pending(&task);

        info!(task_id = %task.id, task_type = %task.task_type, priority = task.priority, "task submitted");
        Ok(task)
    }

    /// Assign a task under `strategy` within the default deadline.
    ///
    /// Unknown tasks are submitted first.
    pub async fn assign_task(&self, task: &Task, strategy: Strategy) -> CoordinatorResult<TaskAssignment> {
        self.assign_task_with_deadline(task, strategy, self.config.assignment_timeout)
            .await
    }

    pub async fn assign_task_with_deadline(
        &self,
        task: &Task,
        strategy: Strategy,
        deadline: Duration,
    ) -> CoordinatorResult<TaskAssignment> {
        let deadline_at = Instant::now() + deadline;
        let _permit = within(deadline_at, "assignment admission", async {
            self.permits
                .acquire()
                .await
                .map_err(|_| CoordinatorError::Timeout("assignment admission".into()))
        })
        .await?;
        self.assign(task, Target::Strategy(strategy), deadline_at).await
    }

    /// Assign a task to one specific agent, bypassing strategy ranking.
    pub async fn assign_task_to_agent(&self, task: &Task, agent_id: &str) -> CoordinatorResult<TaskAssignment> {
        let deadline_at = Instant::now() + self.config.assignment_timeout;
        let _permit = within(deadline_at, "assignment admission", async {
            self.permits
                .acquire()
                .await
                .map_err(|_| CoordinatorError::Timeout("assignment admission".into()))
        })
        .await?;
        self.assign(task, Target::Pinned(agent_id), deadline_at).await
    }

    async fn assign(&self, task: &Task, target: Target<'_>, deadline_at: Instant) -> CoordinatorResult<TaskAssignment> {
        let result = self.assign_inner(task, target, deadline_at).await;
        if let Err(e) = &result {
            debug!(task_id = %task.id, error = %e, "assignment failed");
        }
        result
    }

    async fn assign_inner(
        &self,
        task: &Task,
        target: Target<'_>,
        deadline_at: Instant,
    ) -> CoordinatorResult<TaskAssignment> {
        let task = within(deadline_at, "task lookup", self.load_or_submit(task)).await?;
        if task.status != TaskStatus::Pending {
            return Err(CoordinatorError::InvalidTaskState {
                task_id: task.id.clone(),
                status: task.status,
                expected: "pending",
            });
        }
        within(deadline_at, "dependency check", self.check_dependencies(&task)).await?;

        let (ranked, strategy_name, cursor_class) = match target {
            Target::Strategy(strategy) => {
                let candidates = self.candidates(&task).await;
                if candidates.is_empty() {
                    return Err(CoordinatorError::NoCapableAgent(task.id.clone()));
                }
                let class = capability_class(&task.required_capabilities);
                let after = match strategy {
                    Strategy::RoundRobin => self.cursors.last(&class),
                    _ => None,
                };
                let ranked = rank(
                    strategy,
                    &candidates,
                    &task.requirements,
                    &self.config.weights,
                    after.as_deref(),
                );
                let class = (strategy == Strategy::RoundRobin).then_some(class);
                (ranked, strategy.as_str(), class)
            }
            Target::Pinned(agent_id) => {
                let load = self.check_pinned(agent_id, &task).await?;
                let ranked = vec![Ranked {
                    agent_id: agent_id.to_string(),
                    confidence: (1.0 - load).clamp(0.0, 1.0),
                }];
                (ranked, "pinned", None)
            }
        };

        for candidate in &ranked {
            if let Some(assignment) = self
                .try_assign(&task, candidate, strategy_name, deadline_at)
                .await?
            {
                if let Some(class) = &cursor_class {
                    self.cursors.advance(class, &assignment.agent_id);
                }
                return Ok(assignment);
            }
        }
        Err(CoordinatorError::ResourceExhausted(task.id.clone()))
    }

    async fn load_or_submit(&self, task: &Task) -> CoordinatorResult<Task> {
        match self.state.get_task_state(&task.id).await? {
            Some(stored) => Ok(stored),
            None => self.submit_task(task.clone()).await,
        }
    }

    async fn check_dependencies(&self, task: &Task) -> CoordinatorResult<()> {
        let mut pending = Vec::new();
        for dep in &task.dependencies {
            match self.state.get_task_state(dep).await? {
                Some(t) if t.status == TaskStatus::Completed => {}
                _ => pending.push(dep.clone()),
            }
        }
        if pending.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::DependenciesUnmet {
                task_id: task.id.clone(),
                pending,
            })
        }
    }

    /// Eligible agents advertising every capability the task needs.
    async fn candidates(&self, task: &Task) -> Vec<Candidate> {
        let mut out = Vec::new();
        for (_, slot_ref) in self.registry.slots().await {
            let agent = {
                let slot = slot_ref.lock().await;
                if !slot.is_eligible() || !slot.agent.has_capabilities(&task.required_capabilities) {
                    continue;
                }
                slot.agent.clone()
            };
            let headroom = self
                .resources
                .headroom(&agent.id)
                .await
                .unwrap_or(ResourceSpec::ZERO);
            out.push(Candidate {
                performance: self.performance_of(&agent).await,
                extra_capabilities: agent.extra_capabilities(&task.required_capabilities),
                capability_count: agent.capabilities.len(),
                load: agent.load,
                capacity: agent.capacity,
                headroom,
                agent_id: agent.id,
            });
        }
        out
    }

    async fn performance_of(&self, agent: &Agent) -> f64 {
        match &self.scorer {
            Some(scorer) => scorer.score(&agent.id).await.unwrap_or(agent.performance),
            None => agent.performance,
        }
    }

    async fn check_pinned(&self, agent_id: &str, task: &Task) -> CoordinatorResult<f64> {
        let slot_ref = self.slot(agent_id).await?;
        let slot = slot_ref.lock().await;
        if slot.removed {
            return Err(CoordinatorError::AgentNotFound(agent_id.to_string()));
        }
        if !slot.is_eligible() {
            return Err(CoordinatorError::AgentUnhealthy(agent_id.to_string()));
        }
        if !slot.agent.has_capabilities(&task.required_capabilities) {
            return Err(CoordinatorError::NoCapableAgent(task.id.clone()));
        }
        Ok(slot.agent.load)
    }

    /// Try one ranked agent. `Ok(None)` means move on to the next one.
    async fn try_assign(
        &self,
        task: &Task,
        ranked: &Ranked,
        strategy_name: &str,
        deadline_at: Instant,
    ) -> CoordinatorResult<Option<TaskAssignment>> {
        let Some(slot_ref) = self.registry.get(&ranked.agent_id).await else {
            return Ok(None);
        };
        let agent_id = ranked.agent_id.as_str();
        let mut slot = within(deadline_at, "agent lock", async {
            Ok(slot_ref.lock().await)
        })
        .await?;
        if !slot.is_eligible() {
            debug!(task_id = %task.id, %agent_id, "candidate no longer eligible");
            return Ok(None);
        }

        let allocated = within(deadline_at, "resource allocation", async {
            self.resources
                .allocate_resources(agent_id, &task.requirements, None)
                .await
                .map_err(CoordinatorError::from)
        })
        .await;
        let allocation_id = match allocated {
            Ok(AllocationOutcome::Granted { allocation_id }) => allocation_id,
            Ok(AllocationOutcome::Denied { reason }) => {
                debug!(task_id = %task.id, %agent_id, %reason, "candidate lacks resources");
                return Ok(None);
            }
            Err(CoordinatorError::Resource(ResourceError::UnknownAgent(_))) => return Ok(None),
            Err(e) => return Err(e),
        };

        let assignment = TaskAssignment::new(
            &task.id,
            agent_id,
            &allocation_id,
            strategy_name,
            self.config.estimated_task_duration.as_millis() as u64,
            ranked.confidence,
        );
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if let Err(e) = self
            .state
            .commit_assignment(task, &assignment, None, remaining)
            .await
        {
            self.release_allocation(agent_id, &allocation_id).await;
            return Err(e.into());
        }

        slot.active.insert(
            task.id.clone(),
            ActiveTask {
                allocation_id,
                assignment_id: assignment.id.clone(),
                requirements: task.requirements,
            },
        );
        self.refresh_load(&mut slot).await;
        self.persist_agent_quietly(&slot.agent).await;

        info!(
            task_id = %task.id,
            %agent_id,
            strategy = strategy_name,
            confidence = assignment.confidence,
            "task assigned"
        );
        Ok(Some(assignment))
    }

    /// Move an assigned task to `Running`.
    pub async fn report_task_started(&self, task_id: &str) -> CoordinatorResult<Task> {
        let (slot_ref, agent_id) = self.owner_of(task_id).await?;
        let slot = slot_ref.lock().await;

        let mut task = self.held_task(task_id, &agent_id, &slot).await?;
        if task.status != TaskStatus::Assigned {
            return Err(CoordinatorError::InvalidTaskState {
                task_id: task.id,
                status: task.status,
                expected: "assigned",
            });
        }
        task.transition(TaskStatus::Running)?;
        self.state.set_task_state(&task).await?;
        debug!(%task_id, %agent_id, "task running");
        Ok(task)
    }

    /// Record a task outcome, release its resources and update the agent's
    /// rolling performance.
    ///
    /// A failed task with retries left goes back to `Pending`.
    pub async fn report_task_finished(&self, task_id: &str, success: bool) -> CoordinatorResult<Task> {
        let (slot_ref, agent_id) = self.owner_of(task_id).await?;
        let mut slot = slot_ref.lock().await;

        let mut task = self.held_task(task_id, &agent_id, &slot).await?;
        let mut requeued = false;
        if success {
            if task.status == TaskStatus::Assigned {
                task.transition(TaskStatus::Running)?;
            }
            task.transition(TaskStatus::Completed)?;
        } else {
            task.transition(TaskStatus::Failed)?;
            task.attempts += 1;
            if task.can_transition(TaskStatus::Pending) {
                task.transition(TaskStatus::Pending)?;
                requeued = true;
            }
        }
        self.state.set_task_state(&task).await?;

        if let Some(active) = slot.active.remove(task_id) {
            self.release_allocation(&agent_id, &active.allocation_id).await;
        }
        slot.agent.performance = update_performance(slot.agent.performance, success);
        self.refresh_load(&mut slot).await;
        self.persist_agent_quietly(&slot.agent).await;
        drop(slot);

        if requeued {
            self.publish_pending(&task);
        }
        info!(%task_id, %agent_id, status = ?task.status, attempts = task.attempts, "task finished");
        Ok(task)
    }

    /// Agent currently holding an active task.
    async fn owner_of(&self, task_id: &str) -> CoordinatorResult<(SlotRef, AgentId)> {
        let task = self
            .state
            .get_task_state(task_id)
            .await?
            .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
        let agent_id = match (&task.assigned_agent, task.status.is_active()) {
            (Some(agent_id), true) => agent_id.clone(),
            _ => {
                return Err(CoordinatorError::InvalidTaskState {
                    task_id: task.id,
                    status: task.status,
                    expected: "assigned or running",
                });
            }
        };
        Ok((self.slot(&agent_id).await?, agent_id))
    }

    /// Re-read a task under its agent's lock and confirm the agent still holds it.
    async fn held_task(&self, task_id: &str, agent_id: &str, slot: &AgentSlot) -> CoordinatorResult<Task> {
        let task = self
            .state
            .get_task_state(task_id)
            .await?
            .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.to_string()))?;
        let held = !slot.removed
            && slot.active.contains_key(task_id)
            && task.status.is_active()
            && task.assigned_agent.as_deref() == Some(agent_id);
        if !held {
            return Err(CoordinatorError::InvalidTaskState {
                task_id: task.id,
                status: task.status,
                expected: "assigned or running",
            });
        }
        Ok(task)
    }

    /// Try to assign every pending task, highest priority first.
    pub async fn dispatch_pending(&self, strategy: Strategy) -> CoordinatorResult<DispatchReport> {
        let mut pending: Vec<Task> = self
            .state
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut report = DispatchReport::default();
        for task in pending {
            match self.assign_task(&task, strategy).await {
                Ok(assignment) => report.assigned.push(assignment),
                Err(e @ CoordinatorError::StateStoreUnavailable(_)) => {
                    warn!(error = %e, "dispatch halted");
                    report.halted = true;
                    break;
                }
                Err(e) => report.skipped.push((task.id.clone(), e.to_string())),
            }
        }
        debug!(
            assigned = report.assigned.len(),
            skipped = report.skipped.len(),
            "dispatch pass finished"
        );
        Ok(report)
    }

    // ── Shared helpers ─────────────────────────────────────────────

    pub(crate) async fn slot(&self, agent_id: &str) -> CoordinatorResult<SlotRef> {
        self.registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoordinatorError::AgentNotFound(agent_id.to_string()))
    }

    /// Requeue every task the agent holds and free their allocations.
    ///
    /// Stops at the first durable failure; tasks not yet requeued stay
    /// with the agent.
    pub(crate) async fn release_active(&self, slot: &mut AgentSlot, reason: &str) -> CoordinatorResult<Vec<TaskId>> {
        let agent_id = slot.agent.id.clone();
        let mut requeued = Vec::new();
        let held: Vec<TaskId> = slot.active.keys().cloned().collect();

        for task_id in held {
            let task = self.state.requeue_task(&task_id, &agent_id).await?;
            if let Some(active) = slot.active.remove(&task_id) {
                self.release_allocation(&agent_id, &active.allocation_id).await;
            }
            if let Some(task) = task {
                warn!(%task_id, %agent_id, reason, "task requeued");
                self.publish_pending(&task);
                requeued.push(task_id);
            }
        }
        self.refresh_load(slot).await;
        Ok(requeued)
    }

    pub(crate) async fn release_allocation(&self, agent_id: &str, allocation_id: &str) {
        if let Err(e) = self
            .resources
            .deallocate_resources(agent_id, Some(allocation_id))
            .await
        {
            debug!(%agent_id, %allocation_id, error = %e, "allocation already gone");
        }
    }

    /// Recompute load from the ledger and flip `Idle`/`Busy` accordingly.
    pub(crate) async fn refresh_load(&self, slot: &mut AgentSlot) {
        slot.agent.load = self
            .resources
            .utilization(&slot.agent.id)
            .await
            .unwrap_or(0.0);
        if slot.agent.status.is_eligible() {
            slot.agent.status = if slot.active.is_empty() {
                AgentStatus::Idle
            } else {
                AgentStatus::Busy
            };
        }
    }

    /// Persist an agent record and its allocation totals, logging failures.
    ///
    /// Used after the authoritative change already happened; the next
    /// write or a restore brings the durable copy back in line.
    pub(crate) async fn persist_agent_quietly(&self, agent: &Agent) {
        if let Err(e) = self.state.set_agent_state(agent).await {
            warn!(agent_id = %agent.id, error = %e, "agent state not persisted");
            return;
        }
        if let Some(totals) = self.resources.totals(&agent.id).await
            && let Err(e) = self.state.sync_allocations(&agent.id, &totals).await
        {
            warn!(agent_id = %agent.id, error = %e, "allocations not persisted");
        }
    }

    pub(crate) fn publish_pending(&self, task: &Task) {
        if !self.config.async_dispatch {
            return;
        }
        if let Err(e) = self.state.queue_task(task) {
            warn!(task_id = %task.id, error = %e, "task not published to work stream");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use fleetgrid_resources::ResourceConfig;
    use fleetgrid_state::{
        AllocationRecord, DurableStore, MemoryCache, StateConfig, StateResult, StateStore,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub(crate) fn coordinator_with(config: CoordinatorConfig) -> Coordinator {
        let state = HybridState::in_memory(StateConfig::default()).unwrap();
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default()));
        Coordinator::new(config, state, resources).unwrap()
    }

    pub(crate) fn coordinator() -> Coordinator {
        coordinator_with(CoordinatorConfig::default())
    }

    pub(crate) fn worker(id: &str, caps: &[&str]) -> Agent {
        Agent::new(id, "worker", caps.iter().copied(), ResourceSpec::new(8.0, 8192.0, 0.0, 0.0))
    }

    #[tokio::test]
    async fn capability_based_picks_closest_match() {
        let c = coordinator();
        c.register_agent(worker("A", &["backend", "python"])).await.unwrap();
        c.register_agent(worker("B", &["frontend", "react"])).await.unwrap();
        c.register_agent(worker("C", &["backend", "python", "database"])).await.unwrap();

        let task = Task::new("T1", "worker", 5).with_capabilities(["backend", "python"]);
        let assignment = c.assign_task(&task, Strategy::CapabilityBased).await.unwrap();

        assert_eq!(assignment.agent_id, "A");
        assert_eq!(assignment.strategy, "capability_based");
        assert!(assignment.confidence > 0.0);

        let stored = c.state().get_task_state("T1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_agent.as_deref(), Some("A"));
        assert_eq!(stored.assignment_ref.as_deref(), Some(assignment.id.as_str()));
        assert_eq!(c.get_agent_status("A").await.unwrap().status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn round_robin_cycles_in_id_order() {
        let c = coordinator();
        for id in ["C", "A", "B"] {
            c.register_agent(worker(id, &["backend"])).await.unwrap();
        }

        let mut chosen = Vec::new();
        for i in 0..4 {
            let task = Task::new(&format!("t{i}"), "worker", 1);
            chosen.push(c.assign_task(&task, Strategy::RoundRobin).await.unwrap().agent_id);
        }
        assert_eq!(chosen, vec!["A", "B", "C", "A"]);
    }

    #[tokio::test]
    async fn assigned_agent_always_has_required_capabilities() {
        const CAPS: [&str; 5] = ["a", "b", "c", "d", "e"];
        let mut rng = StdRng::seed_from_u64(7);

        for round in 0..25 {
            let c = coordinator();
            let mut agents = Vec::new();
            for i in 0..rng.random_range(1..6) {
                let caps: Vec<&str> = CAPS.iter().copied().filter(|_| rng.random_bool(0.5)).collect();
                let agent = c.register_agent(worker(&format!("agent-{i}"), &caps)).await.unwrap();
                agents.push(agent);
            }
            let required: BTreeSet<String> = CAPS
                .iter()
                .filter(|_| rng.random_bool(0.3))
                .map(|s| s.to_string())
                .collect();
            let task = Task::new(&format!("task-{round}"), "worker", 1).with_capabilities(required.clone());
            let strategy = Strategy::ALL[round % Strategy::ALL.len()];

            match c.assign_task(&task, strategy).await {
                Ok(assignment) => {
                    let agent = agents.iter().find(|a| a.id == assignment.agent_id).unwrap();
                    assert!(required.is_subset(&agent.capabilities));
                }
                Err(CoordinatorError::NoCapableAgent(_)) => {
                    assert!(agents.iter().all(|a| !required.is_subset(&a.capabilities)));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn no_capable_agent_leaves_task_pending() {
        let c = coordinator();
        c.register_agent(worker("A", &["backend"])).await.unwrap();

        let task = Task::new("gpu-job", "worker", 1).with_capabilities(["cuda"]);
        let err = c.assign_task(&task, Strategy::LeastLoaded).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoCapableAgent(_)));

        let stored = c.state().get_task_state("gpu-job").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.assigned_agent, None);
    }

    #[tokio::test]
    async fn falls_through_to_next_candidate_when_resources_run_out() {
        let c = coordinator();
        c.register_agent(worker("A", &["backend"])).await.unwrap();
        c.register_agent(worker("B", &["backend"])).await.unwrap();

        // 8 cores * 0.85 = 6.8 allocatable per agent.
        let big = ResourceSpec::new(6.0, 100.0, 0.0, 0.0);
        let first = c
            .assign_task(&Task::new("t1", "worker", 1).with_requirements(big), Strategy::LeastLoaded)
            .await
            .unwrap();
        assert_eq!(first.agent_id, "A");

        // RoundRobin ranks A first again (no cursor for this class yet), A is full.
        let second = c
            .assign_task(
                &Task::new("t2", "worker", 1)
                    .with_requirements(big)
                    .with_capabilities(["backend"]),
                Strategy::RoundRobin,
            )
            .await
            .unwrap();
        assert_eq!(second.agent_id, "B");

        let err = c
            .assign_task(&Task::new("t3", "worker", 1).with_requirements(big), Strategy::LeastLoaded)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ResourceExhausted(_)));
        let stored = c.state().get_task_state("t3").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn load_tracks_allocations() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        let task = Task::new("t1", "worker", 1).with_requirements(ResourceSpec::new(4.0, 1024.0, 0.0, 0.0));
        c.assign_task(&task, Strategy::LeastLoaded).await.unwrap();
        assert!((c.get_agent_status("A").await.unwrap().load - 0.5).abs() < 1e-9);

        c.report_task_finished("t1", true).await.unwrap();
        let agent = c.get_agent_status("A").await.unwrap();
        assert_eq!(agent.load, 0.0);
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn duplicate_and_overflow_registration_rejected() {
        let c = coordinator_with(CoordinatorConfig {
            max_agents: 1,
            ..CoordinatorConfig::default()
        });
        c.register_agent(worker("A", &[])).await.unwrap();
        assert!(matches!(
            c.register_agent(worker("A", &[])).await,
            Err(CoordinatorError::DuplicateAgent(_))
        ));
        assert!(matches!(
            c.register_agent(worker("B", &[])).await,
            Err(CoordinatorError::CapacityExceeded { max: 1 })
        ));
    }

    #[tokio::test]
    async fn invalid_capacity_rejected() {
        let c = coordinator();
        let mut agent = worker("A", &[]);
        agent.capacity.cpu_cores = -1.0;
        assert!(matches!(
            c.register_agent(agent).await,
            Err(CoordinatorError::Resource(ResourceError::InvalidCapacity(_)))
        ));
        assert!(c.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn unregister_requeues_held_tasks() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        let task = Task::new("t1", "worker", 1);
        c.assign_task(&task, Strategy::LeastLoaded).await.unwrap();

        let requeued = c.unregister_agent("A").await.unwrap();
        assert_eq!(requeued, vec!["t1".to_string()]);
        assert!(c.state().get_agent_state("A").await.unwrap().is_none());
        assert!(c.resources().totals("A").await.is_none());

        let stored = c.state().get_task_state("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(matches!(
            c.unregister_agent("A").await,
            Err(CoordinatorError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn dependencies_must_complete_first() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        let parent = Task::new("parent", "worker", 1);
        let child = Task::new("child", "worker", 1).with_dependencies(["parent"]);
        c.submit_task(parent.clone()).await.unwrap();

        let err = c.assign_task(&child, Strategy::LeastLoaded).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::DependenciesUnmet { .. }));

        c.assign_task(&parent, Strategy::LeastLoaded).await.unwrap();
        c.report_task_started("parent").await.unwrap();
        c.report_task_finished("parent", true).await.unwrap();

        c.assign_task(&child, Strategy::LeastLoaded).await.unwrap();
    }

    #[tokio::test]
    async fn failed_task_retries_until_exhausted() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        let mut task = Task::new("flaky", "worker", 1);
        task.max_retries = 2;

        c.assign_task(&task, Strategy::LeastLoaded).await.unwrap();
        let after_first = c.report_task_finished("flaky", false).await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.attempts, 1);

        c.assign_task(&task, Strategy::LeastLoaded).await.unwrap();
        let after_second = c.report_task_finished("flaky", false).await.unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);
        assert_eq!(after_second.attempts, 2);

        let agent = c.get_agent_status("A").await.unwrap();
        assert!(agent.performance < 0.5);
        assert!(c.active_tasks("A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reassigning_an_assigned_task_is_rejected() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        let task = Task::new("t1", "worker", 1);
        c.assign_task(&task, Strategy::LeastLoaded).await.unwrap();

        assert!(matches!(
            c.assign_task(&task, Strategy::LeastLoaded).await,
            Err(CoordinatorError::InvalidTaskState { .. })
        ));
    }

    #[tokio::test]
    async fn pinned_assignment_checks_the_agent() {
        let c = coordinator();
        c.register_agent(worker("A", &["backend"])).await.unwrap();

        let needs_gpu = Task::new("t1", "worker", 1).with_capabilities(["cuda"]);
        assert!(matches!(
            c.assign_task_to_agent(&needs_gpu, "A").await,
            Err(CoordinatorError::NoCapableAgent(_))
        ));
        assert!(matches!(
            c.assign_task_to_agent(&Task::new("t2", "worker", 1), "ghost").await,
            Err(CoordinatorError::AgentNotFound(_))
        ));

        let assignment = c
            .assign_task_to_agent(&Task::new("t3", "worker", 1), "A")
            .await
            .unwrap();
        assert_eq!(assignment.strategy, "pinned");
    }

    #[tokio::test]
    async fn dispatch_assigns_by_priority() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        let big = ResourceSpec::new(6.0, 0.0, 0.0, 0.0);
        c.submit_task(Task::new("low", "worker", 1).with_requirements(big)).await.unwrap();
        c.submit_task(Task::new("high", "worker", 9).with_requirements(big)).await.unwrap();

        let report = c.dispatch_pending(Strategy::LeastLoaded).await.unwrap();
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].task_id, "high");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "low");
        assert!(!report.halted);
    }

    #[tokio::test]
    async fn submitted_tasks_reach_the_work_stream() {
        let c = coordinator();
        c.submit_task(Task::new("t1", "render", 1)).await.unwrap();
        let status = c.state().get_queue_status("render").unwrap();
        assert_eq!(status.length, 1);

        assert!(matches!(
            c.submit_task(Task::new("t1", "render", 1)).await,
            Err(CoordinatorError::State(StateError::Duplicate(_)))
        ));
    }

    struct FixedScorer;

    #[async_trait::async_trait]
    impl PerformanceScorer for FixedScorer {
        async fn score(&self, agent_id: &str) -> Option<f64> {
            (agent_id == "B").then_some(1.0)
        }
    }

    #[tokio::test]
    async fn weighted_uses_external_scores() {
        let c = coordinator_with(CoordinatorConfig {
            weights: crate::config::StrategyWeights {
                load: 0.2,
                performance: 0.6,
                capability: 0.2,
            },
            ..CoordinatorConfig::default()
        })
        .with_scorer(Arc::new(FixedScorer));
        c.register_agent(worker("A", &[])).await.unwrap();
        c.register_agent(worker("B", &[])).await.unwrap();

        let assignment = c
            .assign_task(&Task::new("t1", "worker", 1), Strategy::Weighted)
            .await
            .unwrap();
        assert_eq!(assignment.agent_id, "B");
    }

    #[tokio::test]
    async fn ledger_opened_during_registration_survives_reclamation() {
        let c = coordinator();
        // Registration has reserved the id and opened the ledger, but not
        // yet installed the slot.
        c.registry.reserve("A").await.unwrap();
        c.resources
            .register_capacity("A", ResourceSpec::new(8.0, 8192.0, 0.0, 0.0))
            .await
            .unwrap();

        let live = c.live_agents().borrow().clone();
        let report = c.resources.reclaim(&live, Instant::now()).await;
        assert_eq!(report.orphaned_ledgers, 0);
        assert!(c.resources.totals("A").await.is_some());
    }

    #[tokio::test]
    async fn draining_agents_take_no_new_work() {
        let c = coordinator();
        c.register_agent(worker("A", &[])).await.unwrap();
        c.register_agent(worker("B", &[])).await.unwrap();
        assert!(c.drain_agent("B").await.unwrap());

        for i in 0..3 {
            let task = Task::new(&format!("t{i}"), "worker", 1);
            let assignment = c.assign_task(&task, Strategy::RoundRobin).await.unwrap();
            assert_eq!(assignment.agent_id, "A");
        }
        assert!(matches!(
            c.assign_task_to_agent(&Task::new("pinned", "worker", 1), "B").await,
            Err(CoordinatorError::AgentUnhealthy(_))
        ));

        // A busy agent cannot be drained.
        assert!(!c.drain_agent("A").await.unwrap());

        c.undrain_agent("B").await.unwrap();
        c.assign_task_to_agent(&Task::new("pinned", "worker", 1), "B")
            .await
            .unwrap();
    }

    /// Durable store whose assignment commits stall.
    struct SlowCommitStore {
        inner: StateStore,
        delay: Duration,
    }

    impl DurableStore for SlowCommitStore {
        fn ping(&self) -> StateResult<()> {
            self.inner.ping()
        }
        fn insert_agent(&self, agent: &Agent) -> StateResult<()> {
            self.inner.insert_agent(agent)
        }
        fn put_agent(&self, agent: &Agent) -> StateResult<()> {
            self.inner.put_agent(agent)
        }
        fn get_agent(&self, id: &str) -> StateResult<Option<Agent>> {
            self.inner.get_agent(id)
        }
        fn list_agents(&self) -> StateResult<Vec<Agent>> {
            self.inner.list_agents()
        }
        fn delete_agent(&self, id: &str) -> StateResult<bool> {
            self.inner.delete_agent(id)
        }
        fn put_task(&self, task: &Task) -> StateResult<()> {
            self.inner.put_task(task)
        }
        fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
            self.inner.get_task(id)
        }
        fn list_tasks(&self) -> StateResult<Vec<Task>> {
            self.inner.list_tasks()
        }
        fn delete_task(&self, id: &str) -> StateResult<bool> {
            self.inner.delete_task(id)
        }
        fn commit_assignment(
            &self,
            task: &Task,
            assignment: &TaskAssignment,
            supersedes: Option<&str>,
        ) -> StateResult<Task> {
            std::thread::sleep(self.delay);
            self.inner.commit_assignment(task, assignment, supersedes)
        }
        fn revert_assignment(&self, task_id: &str, assignment_id: &str) -> StateResult<bool> {
            self.inner.revert_assignment(task_id, assignment_id)
        }
        fn requeue_task(&self, task_id: &str, agent_id: &str) -> StateResult<Option<Task>> {
            self.inner.requeue_task(task_id, agent_id)
        }
        fn list_assignments(&self, task_id: &str) -> StateResult<Vec<TaskAssignment>> {
            self.inner.list_assignments(task_id)
        }
        fn put_allocations(&self, agent_id: &str, records: &[AllocationRecord]) -> StateResult<()> {
            self.inner.put_allocations(agent_id, records)
        }
        fn list_allocations(&self, agent_id: &str) -> StateResult<Vec<AllocationRecord>> {
            self.inner.list_allocations(agent_id)
        }
        fn purge_finished_tasks(&self, older_than: u64) -> StateResult<u32> {
            self.inner.purge_finished_tasks(older_than)
        }
    }

    #[tokio::test]
    async fn missed_deadline_leaves_task_pending() {
        let store = Arc::new(SlowCommitStore {
            inner: StateStore::open_in_memory().unwrap(),
            delay: Duration::from_millis(400),
        });
        let state = HybridState::new(store.clone(), Arc::new(MemoryCache::new()), StateConfig::default());
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default()));
        let c = Coordinator::new(CoordinatorConfig::default(), state, resources).unwrap();
        c.register_agent(worker("A", &[])).await.unwrap();

        let task = Task::new("t1", "worker", 1).with_requirements(ResourceSpec::new(2.0, 512.0, 0.0, 0.0));
        c.submit_task(task.clone()).await.unwrap();
        let headroom = c.resources().headroom("A").await.unwrap();

        let err = c
            .assign_task_with_deadline(&task, Strategy::LeastLoaded, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout(_)), "got {err:?}");
        assert_eq!(c.resources().headroom("A").await.unwrap(), headroom);
        assert!(c.active_tasks("A").await.unwrap().is_empty());

        // The stalled commit lands late and is rolled back.
        let mut settled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let stored = store.inner.get_task("t1").unwrap().unwrap();
            if stored.status == TaskStatus::Pending && stored.assignment_ref.is_none() {
                settled = true;
                break;
            }
        }
        assert!(settled, "late commit was not rolled back");
        let read = c.state().get_task_state("t1").await.unwrap().unwrap();
        assert_eq!(read.status, TaskStatus::Pending);
    }
}
