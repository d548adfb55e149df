//! Coordinator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::strategy::Strategy;

/// Weights of the `Weighted` strategy's score terms. Must sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyWeights {
    /// Weight of `1 - load`.
    pub load: f64,
    /// Weight of historical performance.
    pub performance: f64,
    /// Weight of capability closeness.
    pub capability: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            load: 1.0 / 3.0,
            performance: 1.0 / 3.0,
            capability: 1.0 / 3.0,
        }
    }
}

impl StrategyWeights {
    pub fn sum(&self) -> f64 {
        self.load + self.performance + self.capability
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Registry size limit.
    pub max_agents: usize,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Consecutive missed checks before an agent is marked unhealthy.
    pub failure_threshold: u32,
    /// Time an agent may stay unhealthy before it is taken offline.
    #[serde(with = "humantime_serde")]
    pub offline_grace: Duration,
    /// Default deadline of one `assign_task` call.
    #[serde(with = "humantime_serde")]
    pub assignment_timeout: Duration,
    /// Max minus min agent load that triggers a rebalance.
    pub rebalance_threshold: f64,
    pub default_strategy: Strategy,
    /// Assignments allowed in flight at once.
    pub max_concurrent_assignments: usize,
    /// Used for `TaskAssignment::estimated_completion`.
    #[serde(with = "humantime_serde")]
    pub estimated_task_duration: Duration,
    /// Also publish submitted and requeued tasks to their pool's work stream.
    pub async_dispatch: bool,
    pub weights: StrategyWeights,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_agents: 256,
            health_check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            offline_grace: Duration::from_secs(90),
            assignment_timeout: Duration::from_secs(5),
            rebalance_threshold: 0.3,
            default_strategy: Strategy::LeastLoaded,
            max_concurrent_assignments: 32,
            estimated_task_duration: Duration::from_secs(60),
            async_dispatch: true,
            weights: StrategyWeights::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.max_agents == 0 {
            return Err(CoordinatorError::InvalidConfig("max_agents must be > 0".into()));
        }
        if self.failure_threshold == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "failure_threshold must be > 0".into(),
            ));
        }
        if self.max_concurrent_assignments == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "max_concurrent_assignments must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rebalance_threshold) {
            return Err(CoordinatorError::InvalidConfig(format!(
                "rebalance_threshold {} outside [0, 1]",
                self.rebalance_threshold
            )));
        }
        let w = &self.weights;
        if [w.load, w.performance, w.capability].iter().any(|x| *x < 0.0)
            || (w.sum() - 1.0).abs() > 0.01
        {
            return Err(CoordinatorError::InvalidConfig(format!(
                "strategy weights must be non-negative and sum to 1.0 (got {:.3})",
                w.sum()
            )));
        }
        Ok(())
    }
}
