//! Scaling policies and decisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetgrid_state::{AgentId, epoch_millis};

use crate::error::{ScalingError, ScalingResult};

/// Pool sizing rules for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub agent_type: String,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Average load above which the pool is under pressure.
    pub scale_up_threshold: f64,
    /// Average load below which the pool is oversized.
    pub scale_down_threshold: f64,
    /// Minimum time between two actions of the same direction.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Growth factor of a scale-up, divisor of a scale-down.
    pub scale_factor: f64,
    /// Pending tasks per eligible agent above which the pool is under pressure.
    #[serde(default = "default_queue_depth_threshold")]
    pub queue_depth_threshold: f64,
}

fn default_queue_depth_threshold() -> f64 {
    5.0
}

impl ScalingPolicy {
    pub fn new(agent_type: &str, min_instances: u32, max_instances: u32) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            min_instances,
            max_instances,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown: Duration::from_secs(300),
            scale_factor: 1.3,
            queue_depth_threshold: default_queue_depth_threshold(),
        }
    }

    pub fn validate(&self) -> ScalingResult<()> {
        let fail = |msg: String| Err(ScalingError::InvalidPolicy(format!("{}: {msg}", self.agent_type)));
        if self.agent_type.is_empty() {
            return Err(ScalingError::InvalidPolicy("empty agent_type".into()));
        }
        if self.min_instances > self.max_instances {
            return fail(format!(
                "min_instances {} > max_instances {}",
                self.min_instances, self.max_instances
            ));
        }
        if self.scale_factor.is_nan() || self.scale_factor <= 1.0 {
            return fail(format!("scale_factor {} must be > 1", self.scale_factor));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return fail(format!(
                "scale_down_threshold {} must be below scale_up_threshold {}",
                self.scale_down_threshold, self.scale_up_threshold
            ));
        }
        if self.queue_depth_threshold < 0.0 {
            return fail("queue_depth_threshold must be >= 0".into());
        }
        Ok(())
    }

    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min_instances, self.max_instances)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,
    /// Wait before the single retry of a failed lifecycle call.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Decisions kept in the audit log.
    pub audit_capacity: usize,
    pub policies: Vec<ScalingPolicy>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(5),
            audit_capacity: 256,
            policies: Vec::new(),
        }
    }
}

impl ScalingConfig {
    pub fn validate(&self) -> ScalingResult<()> {
        let mut seen = std::collections::HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !seen.insert(policy.agent_type.as_str()) {
                return Err(ScalingError::InvalidPolicy(format!(
                    "duplicate policy for {}",
                    policy.agent_type
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Produced by an evaluation, not yet acted on.
    Proposed,
    Executed,
    /// Held back by cooldown or a degraded state layer.
    Suppressed,
    /// The lifecycle call failed; a retry follows.
    Failed,
    /// The retry failed too.
    Escalated,
}

/// One scaling verdict for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub agent_type: String,
    pub action: ScaleAction,
    pub current_count: u32,
    pub target_count: u32,
    pub reason: String,
    pub status: DecisionStatus,
    /// Agents chosen for termination by a scale-down.
    pub victims: Vec<AgentId>,
    /// Last lifecycle failure, if any.
    pub error: Option<String>,
    pub timestamp: u64,
}

impl ScalingDecision {
    pub fn new(agent_type: &str, action: ScaleAction, current: u32, target: u32, reason: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            action,
            current_count: current,
            target_count: target,
            reason: reason.into(),
            status: if action == ScaleAction::NoOp {
                DecisionStatus::Executed
            } else {
                DecisionStatus::Proposed
            },
            victims: Vec::new(),
            error: None,
            timestamp: epoch_millis(),
        }
    }

    pub fn no_op(agent_type: &str, current: u32, reason: impl Into<String>) -> Self {
        Self::new(agent_type, ScaleAction::NoOp, current, current, reason)
    }

    /// Whether the decision asks the lifecycle collaborator to do something.
    pub fn is_actionable(&self) -> bool {
        self.action != ScaleAction::NoOp && self.status == DecisionStatus::Proposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_validation() {
        ScalingPolicy::new("backend", 1, 10).validate().unwrap();

        let mut p = ScalingPolicy::new("backend", 5, 2);
        assert!(p.validate().is_err());

        p = ScalingPolicy::new("backend", 1, 10);
        p.scale_factor = 1.0;
        assert!(p.validate().is_err());

        p = ScalingPolicy::new("backend", 1, 10);
        p.scale_down_threshold = 0.9;
        assert!(matches!(p.validate(), Err(ScalingError::InvalidPolicy(_))));
    }

    #[test]
    fn config_parses_from_toml() {
        let config: ScalingConfig = toml::from_str(
            r#"
            evaluation_interval = "30s"
            retry_backoff = "5s"

            [[policies]]
            agent_type = "backend"
            min_instances = 1
            max_instances = 10
            scale_up_threshold = 0.8
            scale_down_threshold = 0.3
            cooldown = "5m"
            scale_factor = 1.3
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.policies[0].cooldown, Duration::from_secs(300));
        assert_eq!(config.policies[0].queue_depth_threshold, 5.0);
        assert_eq!(config.audit_capacity, 256);
    }

    #[test]
    fn duplicate_policies_rejected() {
        let config = ScalingConfig {
            policies: vec![ScalingPolicy::new("a", 1, 2), ScalingPolicy::new("a", 1, 3)],
            ..ScalingConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
