//! Per-pool coordinator metrics, the scaling manager's main input.

use std::collections::BTreeMap;

use serde::Serialize;

use fleetgrid_state::{Agent, AgentId, Task, TaskStatus, epoch_millis};

/// Aggregate view of the agents of one type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub agent_type: String,
    pub agent_count: usize,
    /// Agents that may receive work (`Idle` or `Busy`).
    pub eligible_count: usize,
    /// Mean load over eligible agents; 0.0 when there are none.
    pub avg_load: f64,
    /// Agents holding at least one unfinished task.
    pub busy_agents: usize,
    /// Eligible agents with no tasks, sorted by id.
    pub idle_agents: Vec<AgentId>,
    /// Pending tasks this pool could serve.
    pub pending_tasks: usize,
}

impl PoolMetrics {
    fn empty(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            agent_count: 0,
            eligible_count: 0,
            avg_load: 0.0,
            busy_agents: 0,
            idle_agents: Vec::new(),
            pending_tasks: 0,
        }
    }

    /// Pending tasks per eligible agent; the raw count when no agent is eligible.
    pub fn queue_depth_per_agent(&self) -> f64 {
        if self.eligible_count == 0 {
            self.pending_tasks as f64
        } else {
            self.pending_tasks as f64 / self.eligible_count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorMetrics {
    pub pools: BTreeMap<String, PoolMetrics>,
    pub total_agents: usize,
    pub pending_tasks: usize,
    pub timestamp: u64,
}

impl CoordinatorMetrics {
    pub fn pool(&self, agent_type: &str) -> Option<&PoolMetrics> {
        self.pools.get(agent_type)
    }
}

/// Build pool metrics from `(agent, active task count)` pairs and the
/// pending tasks.
///
/// A pending task counts toward every pool that has an eligible agent
/// able to serve it; a task nobody can serve counts toward the pool named
/// by its `task_type`.
pub fn compute_metrics(agents: &[(Agent, usize)], tasks: &[Task]) -> CoordinatorMetrics {
    let mut pools: BTreeMap<String, PoolMetrics> = BTreeMap::new();
    let mut load_sums: BTreeMap<String, f64> = BTreeMap::new();

    for (agent, active) in agents {
        let pool = pools
            .entry(agent.agent_type.clone())
            .or_insert_with(|| PoolMetrics::empty(&agent.agent_type));
        pool.agent_count += 1;
        if *active > 0 {
            pool.busy_agents += 1;
        }
        if agent.status.is_eligible() {
            pool.eligible_count += 1;
            *load_sums.entry(agent.agent_type.clone()).or_default() += agent.load;
            if *active == 0 {
                pool.idle_agents.push(agent.id.clone());
            }
        }
    }

    let pending: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    for task in &pending {
        let mut serving: Vec<&str> = agents
            .iter()
            .filter(|(a, _)| a.status.is_eligible() && a.has_capabilities(&task.required_capabilities))
            .map(|(a, _)| a.agent_type.as_str())
            .collect();
        serving.sort_unstable();
        serving.dedup();

        if serving.is_empty() {
            pools
                .entry(task.task_type.clone())
                .or_insert_with(|| PoolMetrics::empty(&task.task_type))
                .pending_tasks += 1;
        } else {
            for agent_type in serving {
                if let Some(pool) = pools.get_mut(agent_type) {
                    pool.pending_tasks += 1;
                }
            }
        }
    }

    for (agent_type, pool) in pools.iter_mut() {
        pool.idle_agents.sort();
        if pool.eligible_count > 0 {
            pool.avg_load = load_sums.get(agent_type).copied().unwrap_or(0.0) / pool.eligible_count as f64;
        }
    }

    CoordinatorMetrics {
        total_agents: agents.len(),
        pending_tasks: pending.len(),
        pools,
        timestamp: epoch_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{AgentStatus, ResourceSpec};

    fn agent(id: &str, agent_type: &str, caps: &[&str], load: f64) -> Agent {
        let mut a = Agent::new(id, agent_type, caps.iter().copied(), ResourceSpec::ZERO);
        a.load = load;
        a
    }

    #[test]
    fn pools_aggregate_by_agent_type() {
        let mut sick = agent("c", "backend", &["backend"], 0.0);
        sick.status = AgentStatus::Unhealthy;
        let agents = vec![
            (agent("a", "backend", &["backend"], 0.8), 2),
            (agent("b", "backend", &["backend"], 0.4), 0),
            (sick, 0),
            (agent("f", "frontend", &["frontend"], 0.1), 1),
        ];
        let metrics = compute_metrics(&agents, &[]);

        let backend = metrics.pool("backend").unwrap();
        assert_eq!(backend.agent_count, 3);
        assert_eq!(backend.eligible_count, 2);
        assert!((backend.avg_load - 0.6).abs() < 1e-9);
        assert_eq!(backend.busy_agents, 1);
        assert_eq!(backend.idle_agents, vec!["b".to_string()]);
        assert_eq!(metrics.total_agents, 4);
    }

    #[test]
    fn pending_depth_follows_capability() {
        let agents = vec![
            (agent("a", "backend", &["backend"], 0.0), 0),
            (agent("f", "frontend", &["frontend"], 0.0), 0),
        ];
        let tasks = vec![
            Task::new("t1", "anything", 1).with_capabilities(["backend"]),
            Task::new("t2", "anything", 1),
            Task::new("t3", "gpu", 1).with_capabilities(["cuda"]),
        ];
        let metrics = compute_metrics(&agents, &tasks);

        // t1 -> backend; t2 -> both pools; t3 -> nobody, counted under "gpu".
        assert_eq!(metrics.pool("backend").unwrap().pending_tasks, 2);
        assert_eq!(metrics.pool("frontend").unwrap().pending_tasks, 1);
        assert_eq!(metrics.pool("gpu").unwrap().pending_tasks, 1);
        assert_eq!(metrics.pool("gpu").unwrap().agent_count, 0);
        assert_eq!(metrics.pending_tasks, 3);
    }
}
