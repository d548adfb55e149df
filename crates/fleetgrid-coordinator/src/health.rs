//! Heartbeat tracking.
//!
//! Each health check consumes the "seen since last check" flag. A check
//! that finds no heartbeat counts as a miss; `failure_threshold`
//! consecutive misses make the agent unhealthy, and an agent that stays
//! unhealthy for the offline grace period is taken offline. A single
//! heartbeat recovers it.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one health check for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// A heartbeat arrived since the previous check.
    Alive,
    /// No heartbeat; carries the consecutive miss count.
    Missed(u32),
    /// This check crossed the failure threshold.
    BecameUnhealthy,
    /// Still unhealthy, grace period not yet over.
    StillUnhealthy,
    /// Unhealthy for longer than the grace period.
    Offline,
}

#[derive(Debug)]
pub struct HeartbeatTracker {
    consecutive_misses: u32,
    failure_threshold: u32,
    seen_since_check: bool,
    unhealthy_since: Option<Instant>,
}

impl HeartbeatTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            consecutive_misses: 0,
            failure_threshold: failure_threshold.max(1),
            seen_since_check: false,
            unhealthy_since: None,
        }
    }

    /// Record a heartbeat. Returns true if the agent was unhealthy.
    pub fn record_heartbeat(&mut self) -> bool {
        let recovered = self.unhealthy_since.is_some();
        if recovered {
            debug!(misses = self.consecutive_misses, "agent recovered");
        }
        self.seen_since_check = true;
        self.consecutive_misses = 0;
        self.unhealthy_since = None;
        recovered
    }

    /// Evaluate one health-check tick.
    pub fn check(&mut self, now: Instant, offline_grace: Duration) -> HealthVerdict {
        if std::mem::take(&mut self.seen_since_check) {
            self.consecutive_misses = 0;
            return HealthVerdict::Alive;
        }

        self.consecutive_misses += 1;
        if self.consecutive_misses < self.failure_threshold {
            return HealthVerdict::Missed(self.consecutive_misses);
        }

        match self.unhealthy_since {
            None => {
                warn!(
                    misses = self.consecutive_misses,
                    threshold = self.failure_threshold,
                    "agent marked unhealthy"
                );
                self.unhealthy_since = Some(now);
                HealthVerdict::BecameUnhealthy
            }
            Some(since) if now.duration_since(since) >= offline_grace => HealthVerdict::Offline,
            Some(_) => HealthVerdict::StillUnhealthy,
        }
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy_since.is_some()
    }
}
