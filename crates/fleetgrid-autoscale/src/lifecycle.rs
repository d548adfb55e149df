//! The external agent lifecycle collaborator.
//!
//! The scaling manager decides; something else (an orchestrator, a shell
//! hook) actually starts and stops agent processes. Spawned agents join
//! the fleet by registering with the coordinator themselves.

use async_trait::async_trait;

use fleetgrid_state::AgentId;

#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    /// Start `count` agents of `agent_type`. Returns the ids it launched.
    async fn spawn(&self, agent_type: &str, count: u32) -> anyhow::Result<Vec<AgentId>>;

    /// Stop one agent.
    async fn terminate(&self, agent_id: &str) -> anyhow::Result<()>;
}
