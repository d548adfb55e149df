//! Subsystem assembly and background loops.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleetgrid_autoscale::{AgentLifecycle, ScalingManager};
use fleetgrid_coordinator::{Coordinator, Strategy};
use fleetgrid_resources::ResourceManager;
use fleetgrid_state::HybridState;

use crate::config::FleetConfig;
use crate::lifecycle::CommandLifecycle;

/// Every subsystem of one fleet, wired together.
pub struct Fleet {
    pub state: HybridState,
    pub resources: Arc<ResourceManager>,
    pub coordinator: Arc<Coordinator>,
    pub scaler: Arc<ScalingManager>,
    config: FleetConfig,
}

impl Fleet {
    /// Open the durable store under `data_dir` and restore the registry from it.
    pub async fn open(config: FleetConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("cannot create {}", data_dir.display()))?;
        let db_path = data_dir.join("fleet.redb");
        let state = HybridState::open(&db_path, config.state.clone())?;
        info!(path = ?db_path, "state store opened");

        let lifecycle = Arc::new(CommandLifecycle::new(&config.lifecycle));
        Self::assemble(config, state, lifecycle).await
    }

    /// Wire the subsystems over an already-open state layer.
    pub async fn assemble(
        config: FleetConfig,
        state: HybridState,
        lifecycle: Arc<dyn AgentLifecycle>,
    ) -> anyhow::Result<Self> {
        let resources = Arc::new(ResourceManager::new(config.resources.clone()));
        info!(safety_margin = config.resources.safety_margin, "resource manager initialized");

        let coordinator = Arc::new(Coordinator::new(
            config.coordinator.clone(),
            state.clone(),
            Arc::clone(&resources),
        )?);
        let restored = coordinator.restore().await?;
        info!(
            agents = restored.agents,
            requeued = restored.requeued.len(),
            strategy = %config.coordinator.default_strategy,
            "coordinator initialized"
        );

        let scaler = Arc::new(ScalingManager::new(
            config.scaling.clone(),
            Arc::clone(&coordinator),
            lifecycle,
        )?);
        info!(policies = config.scaling.policies.len(), "scaling manager initialized");

        Ok(Self {
            state,
            resources,
            coordinator,
            scaler,
            config,
        })
    }

    /// Start every background loop. They all stop when `shutdown` flips.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            Arc::clone(&self.coordinator).run_health_monitor(shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&self.scaler).run(shutdown.clone()),
        ));
        handles.push(tokio::spawn(Arc::clone(&self.resources).run_reclamation(
            self.coordinator.live_agents(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(dispatch_loop(
            Arc::clone(&self.coordinator),
            self.config.coordinator.default_strategy,
            self.config.daemon.dispatch_interval,
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(retention_loop(
            self.state.clone(),
            self.config.daemon.retention_interval,
            self.config.state.task_retention,
            shutdown.clone(),
        )));

        handles
    }
}

/// Match pending tasks against agents, then rebalance.
async fn dispatch_loop(
    coordinator: Arc<Coordinator>,
    strategy: Strategy,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match coordinator.dispatch_pending(strategy).await {
                    Ok(report) => {
                        if !report.assigned.is_empty() || report.halted {
                            info!(
                                assigned = report.assigned.len(),
                                skipped = report.skipped.len(),
                                halted = report.halted,
                                "dispatch pass"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "dispatch pass failed"),
                }
                match coordinator.rebalance_load().await {
                    Ok(report) if !report.migrations.is_empty() => {
                        info!(
                            migrations = report.migrations.len(),
                            spread_before = report.spread_before,
                            spread_after = report.spread_after,
                            "load rebalanced"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "rebalance failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("dispatch loop shutting down");
                return;
            }
        }
    }
}

/// Purge finished tasks older than `retention`.
async fn retention_loop(
    state: HybridState,
    period: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match state.purge_finished_tasks(retention).await {
                    Ok(0) => {}
                    Ok(n) => debug!(purged = n, "finished tasks purged"),
                    Err(e) => warn!(error = %e, "task purge failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("retention loop shutting down");
                return;
            }
        }
    }
}
