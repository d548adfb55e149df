//! Performance scoring.
//!
//! An optional collaborator (a prediction service, say) may supply a
//! performance score per agent. Without one, or when it has no opinion,
//! the agent's own rolling success rate is used; that rate starts at a
//! neutral 0.5.

use async_trait::async_trait;

/// Score an agent starts with before any task has finished.
pub const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Smoothing factor of the rolling success rate.
pub const PERFORMANCE_ALPHA: f64 = 0.2;

#[async_trait]
pub trait PerformanceScorer: Send + Sync {
    /// Score in [0, 1], or `None` to defer to the agent's own history.
    async fn score(&self, agent_id: &str) -> Option<f64>;
}

/// Fold one task outcome into a rolling success rate.
pub fn update_performance(previous: f64, success: bool) -> f64 {
    let outcome = if success { 1.0 } else { 0.0 };
    ((1.0 - PERFORMANCE_ALPHA) * previous + PERFORMANCE_ALPHA * outcome).clamp(0.0, 1.0)
}
