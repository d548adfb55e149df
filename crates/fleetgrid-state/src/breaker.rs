//! Circuit breaker guarding calls to one backend.
//!
//! Closed: calls pass; consecutive failures are counted.
//! Open: calls fail fast until `recovery_timeout` has elapsed.
//! HalfOpen: one trial call is admitted; success closes, failure reopens.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, moving Open to HalfOpen once the recovery timeout passed.
    pub fn state(&self) -> CircuitState {
        let Ok(mut inner) = self.inner.lock() else {
            return CircuitState::Open;
        };
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state != CircuitState::Closed {
            info!(breaker = self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;
        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                breaker = self.name,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.recovery_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}
