//! Agent lifecycle backed by shell commands.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use fleetgrid_autoscale::AgentLifecycle;
use fleetgrid_state::AgentId;

use crate::config::LifecycleConfig;

/// Runs the configured `spawn_command` / `terminate_command` through `sh -c`.
///
/// Spawn output is read as one new agent id per non-empty line. The spawned
/// agents are expected to register themselves with the coordinator.
pub struct CommandLifecycle {
    spawn_command: Option<String>,
    terminate_command: Option<String>,
    timeout: Duration,
}

impl CommandLifecycle {
    pub fn new(config: &LifecycleConfig) -> Self {
        Self {
            spawn_command: config.spawn_command.clone(),
            terminate_command: config.terminate_command.clone(),
            timeout: config.command_timeout,
        }
    }

    async fn run(&self, script: &str, env: &[(&str, String)]) -> anyhow::Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("`{script}` timed out after {:?}", self.timeout))?
            .with_context(|| format!("cannot run `{script}`"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("`{script}` exited with {}: {}", output.status, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl AgentLifecycle for CommandLifecycle {
    async fn spawn(&self, agent_type: &str, count: u32) -> anyhow::Result<Vec<AgentId>> {
        let Some(script) = &self.spawn_command else {
            bail!("no lifecycle.spawn_command configured");
        };
        let stdout = self
            .run(
                script,
                &[
                    ("FLEET_AGENT_TYPE", agent_type.to_string()),
                    ("FLEET_AGENT_COUNT", count.to_string()),
                ],
            )
            .await?;
        let ids: Vec<AgentId> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        info!(agent_type, requested = count, spawned = ids.len(), "spawn command finished");
        Ok(ids)
    }

    async fn terminate(&self, agent_id: &str) -> anyhow::Result<()> {
        let Some(script) = &self.terminate_command else {
            bail!("no lifecycle.terminate_command configured");
        };
        self.run(script, &[("FLEET_AGENT_ID", agent_id.to_string())])
            .await?;
        debug!(agent_id, "terminate command finished");
        Ok(())
    }
}
