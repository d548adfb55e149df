//! Host metrics collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Point-in-time host usage as reported by the metrics source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_available_mb: f64,
    pub disk_used_gb: f64,
    pub network_io_mbps: f64,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

/// Source of host-level usage figures (OS counters, an exporter, ...).
#[async_trait]
pub trait SystemMetrics: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<SystemSnapshot>;
}

/// A metrics source that always reports the same snapshot.
pub struct StaticMetrics(pub SystemSnapshot);

#[async_trait]
impl SystemMetrics for StaticMetrics {
    async fn snapshot(&self) -> anyhow::Result<SystemSnapshot> {
        Ok(self.0.clone())
    }
}
