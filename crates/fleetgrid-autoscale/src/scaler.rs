//! Scaling manager: load-driven agent pool sizing.
//!
//! Each evaluation reads pool metrics from the coordinator, the capacity
//! snapshot from the resource manager and the state layer's health, then
//! produces one decision per policy. Decisions that survive the stability
//! and cooldown rules are handed to the lifecycle collaborator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use fleetgrid_coordinator::{Coordinator, CoordinatorError, CoordinatorMetrics, PoolMetrics};
use fleetgrid_resources::CapacitySnapshot;
use fleetgrid_state::StateHealthReport;

use crate::error::{ScalingError, ScalingResult};
use crate::lifecycle::AgentLifecycle;
use crate::policy::{DecisionStatus, ScaleAction, ScalingConfig, ScalingDecision, ScalingPolicy};

/// Consecutive breaching evaluations needed before acting.
pub const STABILITY_CYCLES: u32 = 2;

/// Per-agent-type evaluation memory.
#[derive(Debug, Default)]
struct PoolState {
    /// Direction and length of the current breach streak.
    streak: Option<(ScaleAction, u32)>,
    last_up: Option<Instant>,
    last_down: Option<Instant>,
}

impl PoolState {
    fn last_fired(&self, action: ScaleAction) -> Option<Instant> {
        match action {
            ScaleAction::ScaleUp => self.last_up,
            ScaleAction::ScaleDown => self.last_down,
            ScaleAction::NoOp => None,
        }
    }

    fn fire(&mut self, action: ScaleAction, now: Instant) {
        match action {
            ScaleAction::ScaleUp => self.last_up = Some(now),
            ScaleAction::ScaleDown => self.last_down = Some(now),
            ScaleAction::NoOp => {}
        }
    }

    /// Cooldown left for `action`, if any.
    fn cooldown_left(&self, action: ScaleAction, cooldown: std::time::Duration, now: Instant) -> Option<std::time::Duration> {
        let elapsed = now.duration_since(self.last_fired(action)?);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }
}

pub struct ScalingManager {
    config: ScalingConfig,
    policies: BTreeMap<String, ScalingPolicy>,
    coordinator: Arc<Coordinator>,
    lifecycle: Arc<dyn AgentLifecycle>,
    pools: Mutex<HashMap<String, PoolState>>,
    audit: Mutex<VecDeque<ScalingDecision>>,
}

impl ScalingManager {
    pub fn new(
        config: ScalingConfig,
        coordinator: Arc<Coordinator>,
        lifecycle: Arc<dyn AgentLifecycle>,
    ) -> ScalingResult<Self> {
        config.validate()?;
        let policies = config
            .policies
            .iter()
            .map(|p| (p.agent_type.clone(), p.clone()))
            .collect();
        Ok(Self {
            config,
            policies,
            coordinator,
            lifecycle,
            pools: Mutex::new(HashMap::new()),
            audit: Mutex::new(VecDeque::new()),
        })
    }

    pub fn policy(&self, agent_type: &str) -> ScalingResult<&ScalingPolicy> {
        self.policies
            .get(agent_type)
            .ok_or_else(|| ScalingError::UnknownAgentType(agent_type.to_string()))
    }

    /// Decide, per policy, whether its pool should grow or shrink.
    ///
    /// Does not act: proposed decisions go to [`Self::execute`].
    pub async fn check_scaling_needs(
        &self,
        metrics: &CoordinatorMetrics,
        capacity: &CapacitySnapshot,
        health: &StateHealthReport,
    ) -> Vec<ScalingDecision> {
        let now = Instant::now();
        let decisions: Vec<ScalingDecision> = {
            let mut pools = self.pools.lock().await;
            self.policies
                .values()
                .map(|policy| {
                    let state = pools.entry(policy.agent_type.clone()).or_default();
                    evaluate_pool(policy, metrics.pool(&policy.agent_type), capacity, health, state, now)
                })
                .collect()
        };

        for decision in &decisions {
            match decision.status {
                DecisionStatus::Suppressed => warn!(
                    agent_type = %decision.agent_type,
                    action = ?decision.action,
                    reason = %decision.reason,
                    "scaling decision suppressed"
                ),
                DecisionStatus::Proposed => info!(
                    agent_type = %decision.agent_type,
                    action = ?decision.action,
                    from = decision.current_count,
                    to = decision.target_count,
                    reason = %decision.reason,
                    "scaling decision"
                ),
                _ => debug!(agent_type = %decision.agent_type, reason = %decision.reason, "no scaling needed"),
            }
            self.record(decision.clone()).await;
        }
        decisions
    }

    /// Carry out a proposed decision, retrying once after `retry_backoff`.
    ///
    /// A second failure escalates: the decision is logged at error level
    /// and returned as [`DecisionStatus::Escalated`].
    pub async fn execute(&self, mut decision: ScalingDecision) -> ScalingDecision {
        if !decision.is_actionable() {
            return decision;
        }

        if let Err(first) = self.apply(&decision).await {
            decision.status = DecisionStatus::Failed;
            decision.error = Some(first.to_string());
            warn!(
                agent_type = %decision.agent_type,
                action = ?decision.action,
                error = %first,
                backoff = ?self.config.retry_backoff,
                "scaling action failed, retrying"
            );
            self.record(decision.clone()).await;
            tokio::time::sleep(self.config.retry_backoff).await;

            if let Err(second) = self.apply(&decision).await {
                decision.status = DecisionStatus::Escalated;
                decision.error = Some(second.to_string());
                error!(
                    agent_type = %decision.agent_type,
                    action = ?decision.action,
                    target = decision.target_count,
                    error = %second,
                    "scaling action failed twice, escalating"
                );
                self.record(decision.clone()).await;
                return decision;
            }
        }

        decision.status = DecisionStatus::Executed;
        info!(
            agent_type = %decision.agent_type,
            action = ?decision.action,
            from = decision.current_count,
            to = decision.target_count,
            "scaling executed"
        );
        self.record(decision.clone()).await;
        decision
    }

    async fn apply(&self, decision: &ScalingDecision) -> ScalingResult<()> {
        match decision.action {
            ScaleAction::ScaleUp => {
                let count = decision.target_count.saturating_sub(decision.current_count);
                let spawned = self
                    .lifecycle
                    .spawn(&decision.agent_type, count)
                    .await
                    .map_err(|e| ScalingError::Lifecycle(format!("spawn: {e:#}")))?;
                debug!(agent_type = %decision.agent_type, ?spawned, "agents spawned");
                Ok(())
            }
            ScaleAction::ScaleDown => {
                for agent_id in &decision.victims {
                    match self.coordinator.drain_agent(agent_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(
                                agent_type = %decision.agent_type,
                                %agent_id,
                                "scale-down victim picked up work, sparing it"
                            );
                            continue;
                        }
                        // Already gone, e.g. terminated by a first attempt.
                        Err(CoordinatorError::AgentNotFound(_)) => continue,
                        Err(e) => return Err(e.into()),
                    }
                    if let Err(e) = self.lifecycle.terminate(agent_id).await {
                        self.coordinator.undrain_agent(agent_id).await.ok();
                        return Err(ScalingError::Lifecycle(format!("terminate {agent_id}: {e:#}")));
                    }
                    match self.coordinator.unregister_agent(agent_id).await {
                        Ok(_) | Err(CoordinatorError::AgentNotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            ScaleAction::NoOp => Ok(()),
        }
    }

    /// One full cycle: gather inputs, decide, execute.
    pub async fn evaluate(&self) -> ScalingResult<Vec<ScalingDecision>> {
        let metrics = self.coordinator.metrics().await?;
        let capacity = self.coordinator.resources().capacity_snapshot().await;
        let health = self.coordinator.state().health_check().await;

        let mut out = Vec::new();
        for decision in self.check_scaling_needs(&metrics, &capacity, &health).await {
            out.push(self.execute(decision).await);
        }
        Ok(out)
    }

    /// Evaluate every `evaluation_interval` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.evaluation_interval, policies = self.policies.len(), "scaling manager started");
        let mut interval = tokio::time::interval(self.config.evaluation_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.evaluate().await {
                        error!(error = %e, "scaling evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scaling manager shutting down");
                    return;
                }
            }
        }
    }

    // ── Manual scaling ─────────────────────────────────────────────

    /// Add up to `count` agents, bounded by `max_instances`.
    pub async fn scale_up(&self, agent_type: &str, count: u32) -> ScalingResult<ScalingDecision> {
        let policy = self.policy(agent_type)?;
        let metrics = self.coordinator.metrics().await?;
        let current = metrics.pool(agent_type).map_or(0, |p| p.agent_count as u32);
        let target = policy.clamp(current.saturating_add(count)).max(current);
        if target == current {
            return Ok(ScalingDecision::no_op(agent_type, current, "already at max_instances"));
        }

        self.claim_cooldown(policy, ScaleAction::ScaleUp).await?;
        let decision = ScalingDecision::new(
            agent_type,
            ScaleAction::ScaleUp,
            current,
            target,
            format!("manual scale-up by {count}"),
        );
        self.record(decision.clone()).await;
        Ok(self.execute(decision).await)
    }

    /// Remove up to `count` idle agents, bounded by `min_instances`.
    pub async fn scale_down(&self, agent_type: &str, count: u32) -> ScalingResult<ScalingDecision> {
        let policy = self.policy(agent_type)?;
        let metrics = self.coordinator.metrics().await?;
        let Some(pool) = metrics.pool(agent_type) else {
            return Ok(ScalingDecision::no_op(agent_type, 0, "no agents"));
        };
        let current = pool.agent_count as u32;
        let floor = policy.clamp(current.saturating_sub(count)).min(current);
        let victims = pick_victims(pool, current - floor);
        if victims.is_empty() {
            return Ok(ScalingDecision::no_op(agent_type, current, "no idle agents above min_instances"));
        }

        self.claim_cooldown(policy, ScaleAction::ScaleDown).await?;
        let mut decision = ScalingDecision::new(
            agent_type,
            ScaleAction::ScaleDown,
            current,
            current - victims.len() as u32,
            format!("manual scale-down by {count}"),
        );
        decision.victims = victims;
        self.record(decision.clone()).await;
        Ok(self.execute(decision).await)
    }

    async fn claim_cooldown(&self, policy: &ScalingPolicy, action: ScaleAction) -> ScalingResult<()> {
        let now = Instant::now();
        let mut pools = self.pools.lock().await;
        let state = pools.entry(policy.agent_type.clone()).or_default();
        if let Some(remaining) = state.cooldown_left(action, policy.cooldown, now) {
            return Err(ScalingError::CooldownViolation {
                agent_type: policy.agent_type.clone(),
                action,
                remaining,
            });
        }
        state.fire(action, now);
        Ok(())
    }

    // ── Audit ──────────────────────────────────────────────────────

    async fn record(&self, decision: ScalingDecision) {
        let mut audit = self.audit.lock().await;
        if audit.len() >= self.config.audit_capacity {
            audit.pop_front();
        }
        audit.push_back(decision);
    }

    /// Recorded decisions, oldest first.
    pub async fn audit_log(&self) -> Vec<ScalingDecision> {
        self.audit.lock().await.iter().cloned().collect()
    }
}

/// Idle agents to terminate, highest ids first.
fn pick_victims(pool: &PoolMetrics, count: u32) -> Vec<String> {
    pool.idle_agents
        .iter()
        .rev()
        .take(count as usize)
        .cloned()
        .collect()
}

fn evaluate_pool(
    policy: &ScalingPolicy,
    pool: Option<&PoolMetrics>,
    capacity: &CapacitySnapshot,
    health: &StateHealthReport,
    state: &mut PoolState,
    now: Instant,
) -> ScalingDecision {
    let agent_type = policy.agent_type.as_str();
    let current = pool.map_or(0, |p| p.agent_count as u32);
    let avg_load = pool.map_or(0.0, |p| p.avg_load);
    let depth = pool.map_or(0.0, |p| p.queue_depth_per_agent());
    let pending = pool.map_or(0, |p| p.pending_tasks);
    let busy = pool.map_or(0, |p| p.busy_agents as u32);
    let fleet_load = 1.0 - capacity.headroom_ratio;

    let (signal, reason) = if current < policy.min_instances {
        (ScaleAction::ScaleUp, format!("{current} agents, below min_instances {}", policy.min_instances))
    } else if current > policy.max_instances {
        (ScaleAction::ScaleDown, format!("{current} agents, above max_instances {}", policy.max_instances))
    } else if avg_load > policy.scale_up_threshold {
        (
            ScaleAction::ScaleUp,
            format!("average load {avg_load:.2} above {:.2}", policy.scale_up_threshold),
        )
    } else if depth > policy.queue_depth_threshold {
        (
            ScaleAction::ScaleUp,
            format!("queue depth {depth:.1} per agent above {:.1}", policy.queue_depth_threshold),
        )
    } else if avg_load < policy.scale_down_threshold && pending == 0 && fleet_load < policy.scale_up_threshold {
        (
            ScaleAction::ScaleDown,
            format!("average load {avg_load:.2} below {:.2}", policy.scale_down_threshold),
        )
    } else {
        state.streak = None;
        return ScalingDecision::no_op(agent_type, current, "within thresholds");
    };

    let streak = match state.streak {
        Some((action, n)) if action == signal => n + 1,
        _ => 1,
    };
    state.streak = Some((signal, streak));
    if streak < STABILITY_CYCLES {
        return ScalingDecision::no_op(
            agent_type,
            current,
            format!("{reason}; awaiting confirmation ({streak}/{STABILITY_CYCLES})"),
        );
    }

    let mut victims = Vec::new();
    let target = match signal {
        ScaleAction::ScaleUp => {
            let grown = ((current as f64) * policy.scale_factor).ceil() as u32;
            policy.clamp(grown.max(current + 1))
        }
        _ => {
            let shrunk = ((current as f64) / policy.scale_factor).floor() as u32;
            let floor = policy.clamp(shrunk).max(busy).min(current);
            if let Some(pool) = pool {
                victims = pick_victims(pool, current - floor);
            }
            current - victims.len() as u32
        }
    };
    if target == current {
        return ScalingDecision::no_op(agent_type, current, format!("{reason}; no room to act"));
    }

    let mut decision = ScalingDecision::new(agent_type, signal, current, target, reason);
    decision.victims = victims;

    if signal == ScaleAction::ScaleUp && !health.is_healthy() {
        decision.status = DecisionStatus::Suppressed;
        decision.reason = format!("{}; state layer {:?}", decision.reason, health.status);
        return decision;
    }
    if let Some(remaining) = state.cooldown_left(signal, policy.cooldown, now) {
        decision.status = DecisionStatus::Suppressed;
        decision.reason = format!("{}; cooldown {remaining:?} left", decision.reason);
        return decision;
    }

    state.fire(signal, now);
    state.streak = None;
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use fleetgrid_coordinator::CoordinatorConfig;
    use fleetgrid_resources::{ResourceConfig, ResourceManager};
    use fleetgrid_state::{
        Agent, AgentId, CircuitState, HybridState, ResourceSpec, StateConfig, StoreStatus, Task,
        TaskStatus,
    };

    #[derive(Default)]
    struct RecordingLifecycle {
        failures_left: AtomicU32,
        spawned: std::sync::Mutex<Vec<(String, u32)>>,
        terminated: std::sync::Mutex<Vec<AgentId>>,
    }

    impl RecordingLifecycle {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Self::default()
            }
        }

        fn should_fail(&self) -> bool {
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl AgentLifecycle for RecordingLifecycle {
        async fn spawn(&self, agent_type: &str, count: u32) -> anyhow::Result<Vec<AgentId>> {
            if self.should_fail() {
                anyhow::bail!("spawner offline");
            }
            self.spawned.lock().unwrap().push((agent_type.to_string(), count));
            Ok((0..count).map(|i| format!("{agent_type}-new-{i}")).collect())
        }

        async fn terminate(&self, agent_id: &str) -> anyhow::Result<()> {
            if self.should_fail() {
                anyhow::bail!("terminator offline");
            }
            self.terminated.lock().unwrap().push(agent_id.to_string());
            Ok(())
        }
    }

    fn coordinator() -> Arc<Coordinator> {
        let state = HybridState::in_memory(StateConfig::default()).unwrap();
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default()));
        Arc::new(Coordinator::new(CoordinatorConfig::default(), state, resources).unwrap())
    }

    fn manager_with(lifecycle: Arc<RecordingLifecycle>, policy: ScalingPolicy) -> ScalingManager {
        let config = ScalingConfig {
            retry_backoff: Duration::from_millis(10),
            policies: vec![policy],
            ..ScalingConfig::default()
        };
        ScalingManager::new(config, coordinator(), lifecycle).unwrap()
    }

    fn manager(policy: ScalingPolicy) -> ScalingManager {
        manager_with(Arc::new(RecordingLifecycle::default()), policy)
    }

    fn pool(count: usize, avg_load: f64, pending: usize, busy: usize, idle: &[&str]) -> CoordinatorMetrics {
        let pool = PoolMetrics {
            agent_type: "backend".into(),
            agent_count: count,
            eligible_count: count,
            avg_load,
            busy_agents: busy,
            idle_agents: idle.iter().map(|s| s.to_string()).collect(),
            pending_tasks: pending,
        };
        CoordinatorMetrics {
            pools: BTreeMap::from([("backend".to_string(), pool)]),
            total_agents: count,
            pending_tasks: pending,
            timestamp: 0,
        }
    }

    fn capacity(headroom_ratio: f64) -> CapacitySnapshot {
        CapacitySnapshot {
            capacity: ResourceSpec::ZERO,
            allocated: ResourceSpec::ZERO,
            headroom_ratio,
            agents: BTreeMap::new(),
        }
    }

    fn health(status: StoreStatus) -> StateHealthReport {
        StateHealthReport {
            status,
            durable_reachable: true,
            durable_circuit: CircuitState::Closed,
            cache_reachable: status == StoreStatus::Healthy,
            cache_circuit: CircuitState::Closed,
            cache_hits: 0,
            cache_misses: 0,
            hit_ratio: 1.0,
            p95_latency_ms: 1.0,
            checked_at: 0,
        }
    }

    async fn check(m: &ScalingManager, metrics: &CoordinatorMetrics) -> ScalingDecision {
        m.check_scaling_needs(metrics, &capacity(0.5), &health(StoreStatus::Healthy))
            .await
            .remove(0)
    }

    #[tokio::test]
    async fn sustained_load_scales_up_after_two_cycles() {
        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let hot = pool(4, 0.85, 0, 4, &[]);

        let first = check(&m, &hot).await;
        assert_eq!(first.action, ScaleAction::NoOp);

        let second = check(&m, &hot).await;
        assert_eq!(second.action, ScaleAction::ScaleUp);
        assert_eq!(second.status, DecisionStatus::Proposed);
        assert_eq!(second.target_count, 6); // ceil(4 * 1.3)
    }

    #[tokio::test]
    async fn scale_up_is_clamped_to_max() {
        let m = manager(ScalingPolicy::new("backend", 1, 5));
        let hot = pool(4, 0.95, 0, 4, &[]);
        check(&m, &hot).await;
        assert_eq!(check(&m, &hot).await.target_count, 5);
    }

    #[tokio::test]
    async fn transient_spikes_are_ignored() {
        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let hot = pool(4, 0.9, 0, 4, &[]);
        let calm = pool(4, 0.5, 0, 4, &[]);

        for _ in 0..3 {
            assert_eq!(check(&m, &hot).await.action, ScaleAction::NoOp);
            assert_eq!(check(&m, &calm).await.action, ScaleAction::NoOp);
        }
    }

    #[tokio::test]
    async fn queue_depth_alone_triggers_scale_up() {
        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let backlog = pool(2, 0.1, 20, 0, &[]);
        check(&m, &backlog).await;
        let decision = check(&m, &backlog).await;
        assert_eq!(decision.action, ScaleAction::ScaleUp);
        assert_eq!(decision.target_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn same_direction_is_suppressed_during_cooldown() {
        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let hot = pool(4, 0.9, 0, 4, &[]);

        check(&m, &hot).await;
        assert_eq!(check(&m, &hot).await.status, DecisionStatus::Proposed);

        check(&m, &hot).await;
        let suppressed = check(&m, &hot).await;
        assert_eq!(suppressed.action, ScaleAction::ScaleUp);
        assert_eq!(suppressed.status, DecisionStatus::Suppressed);
        assert!(suppressed.reason.contains("cooldown"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(check(&m, &hot).await.status, DecisionStatus::Proposed);

        let audit = m.audit_log().await;
        assert!(audit.iter().any(|d| d.status == DecisionStatus::Suppressed));
    }

    #[tokio::test]
    async fn degraded_state_blocks_scale_up() {
        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let hot = pool(4, 0.9, 0, 4, &[]);
        let degraded = health(StoreStatus::Degraded);

        m.check_scaling_needs(&hot, &capacity(0.5), &degraded).await;
        let decision = m
            .check_scaling_needs(&hot, &capacity(0.5), &degraded)
            .await
            .remove(0);
        assert_eq!(decision.status, DecisionStatus::Suppressed);
    }

    #[tokio::test]
    async fn scale_down_targets_idle_agents_and_respects_busy_floor() {
        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let quiet = pool(5, 0.1, 0, 2, &["a", "b", "c"]);
        check(&m, &quiet).await;
        let decision = check(&m, &quiet).await;
        assert_eq!(decision.action, ScaleAction::ScaleDown);
        // floor(5 / 1.3) = 3, above the 2 busy agents.
        assert_eq!(decision.target_count, 3);
        assert_eq!(decision.victims, vec!["c".to_string(), "b".to_string()]);

        let m = manager(ScalingPolicy::new("backend", 1, 10));
        let all_busy = pool(4, 0.1, 0, 4, &[]);
        check(&m, &all_busy).await;
        assert_eq!(check(&m, &all_busy).await.action, ScaleAction::NoOp);
    }

    #[tokio::test]
    async fn below_min_scales_up() {
        let m = manager(ScalingPolicy::new("backend", 2, 10));
        let empty = CoordinatorMetrics {
            pools: BTreeMap::new(),
            total_agents: 0,
            pending_tasks: 0,
            timestamp: 0,
        };
        check(&m, &empty).await;
        let decision = check(&m, &empty).await;
        assert_eq!(decision.action, ScaleAction::ScaleUp);
        assert_eq!(decision.target_count, 2);
    }

    #[tokio::test]
    async fn failed_action_retries_once_then_escalates() {
        let lifecycle = Arc::new(RecordingLifecycle::failing(2));
        let m = manager_with(Arc::clone(&lifecycle), ScalingPolicy::new("backend", 1, 10));
        let proposed = ScalingDecision::new("backend", ScaleAction::ScaleUp, 1, 2, "test");

        let outcome = m.execute(proposed).await;
        assert_eq!(outcome.status, DecisionStatus::Escalated);
        assert!(outcome.error.as_deref().unwrap().contains("spawner offline"));
        assert!(lifecycle.spawned.lock().unwrap().is_empty());

        let statuses: Vec<DecisionStatus> = m.audit_log().await.iter().map(|d| d.status).collect();
        assert_eq!(statuses, vec![DecisionStatus::Failed, DecisionStatus::Escalated]);
    }

    #[tokio::test]
    async fn retry_can_succeed() {
        let lifecycle = Arc::new(RecordingLifecycle::failing(1));
        let m = manager_with(Arc::clone(&lifecycle), ScalingPolicy::new("backend", 1, 10));
        let proposed = ScalingDecision::new("backend", ScaleAction::ScaleUp, 1, 3, "test");

        let outcome = m.execute(proposed).await;
        assert_eq!(outcome.status, DecisionStatus::Executed);
        assert_eq!(*lifecycle.spawned.lock().unwrap(), vec![("backend".to_string(), 2)]);
    }

    #[tokio::test]
    async fn manual_scale_down_terminates_and_unregisters() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let m = manager_with(Arc::clone(&lifecycle), ScalingPolicy::new("backend", 1, 10));
        for id in ["a", "b", "c"] {
            m.coordinator
                .register_agent(Agent::new(id, "backend", ["backend"], ResourceSpec::new(4.0, 4096.0, 0.0, 0.0)))
                .await
                .unwrap();
        }

        let decision = m.scale_down("backend", 5).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Executed);
        assert_eq!(decision.target_count, 1);
        assert_eq!(*lifecycle.terminated.lock().unwrap(), vec!["c".to_string(), "b".to_string()]);
        assert_eq!(m.coordinator.list_agents().await.len(), 1);

        assert!(matches!(
            m.scale_down("backend", 1).await,
            Ok(d) if d.action == ScaleAction::NoOp
        ));
    }

    #[tokio::test]
    async fn victims_that_became_busy_are_spared() {
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let m = manager_with(Arc::clone(&lifecycle), ScalingPolicy::new("backend", 1, 10));
        for id in ["backend-1", "backend-2"] {
            m.coordinator
                .register_agent(Agent::new(id, "backend", ["backend"], ResourceSpec::new(4.0, 4096.0, 0.0, 0.0)))
                .await
                .unwrap();
        }
        let mut decision = ScalingDecision::new("backend", ScaleAction::ScaleDown, 2, 1, "idle pool");
        decision.victims = vec!["backend-2".to_string()];

        // Work lands on the victim between decision and execution.
        m.coordinator
            .assign_task_to_agent(&Task::new("t1", "backend", 1), "backend-2")
            .await
            .unwrap();

        let outcome = m.execute(decision).await;
        assert_eq!(outcome.status, DecisionStatus::Executed);
        assert!(lifecycle.terminated.lock().unwrap().is_empty());
        assert_eq!(m.coordinator.list_agents().await.len(), 2);
        let task = m.coordinator.state().get_task_state("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("backend-2"));
    }

    #[tokio::test]
    async fn failed_termination_returns_victim_to_service() {
        let lifecycle = Arc::new(RecordingLifecycle::failing(2));
        let m = manager_with(Arc::clone(&lifecycle), ScalingPolicy::new("backend", 1, 10));
        for id in ["a", "b"] {
            m.coordinator
                .register_agent(Agent::new(id, "backend", ["backend"], ResourceSpec::new(4.0, 4096.0, 0.0, 0.0)))
                .await
                .unwrap();
        }
        let mut decision = ScalingDecision::new("backend", ScaleAction::ScaleDown, 2, 1, "idle pool");
        decision.victims = vec!["b".to_string()];

        let outcome = m.execute(decision).await;
        assert_eq!(outcome.status, DecisionStatus::Escalated);
        m.coordinator
            .assign_task_to_agent(&Task::new("t1", "backend", 1), "b")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_scale_up_honours_cooldown() {
        let m = manager(ScalingPolicy::new("backend", 0, 10));
        let first = m.scale_up("backend", 2).await.unwrap();
        assert_eq!(first.status, DecisionStatus::Executed);
        assert_eq!(first.target_count, 2);

        assert!(matches!(
            m.scale_up("backend", 1).await,
            Err(ScalingError::CooldownViolation { action: ScaleAction::ScaleUp, .. })
        ));
        assert!(matches!(
            m.scale_up("frontend", 1).await,
            Err(ScalingError::UnknownAgentType(_))
        ));
    }
}
