//! Load-balancing strategies.
//!
//! Each strategy turns a candidate set into a deterministic preference
//! order, ties broken by ascending agent id. The coordinator walks the
//! order and takes the first agent whose allocation succeeds.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use fleetgrid_state::{AgentId, ResourceKind, ResourceSpec};

use crate::config::StrategyWeights;

/// The fixed set of agent selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    ResourceBased,
    CapabilityBased,
    Weighted,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::RoundRobin,
        Strategy::LeastLoaded,
        Strategy::ResourceBased,
        Strategy::CapabilityBased,
        Strategy::Weighted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::ResourceBased => "resource_based",
            Strategy::CapabilityBased => "capability_based",
            Strategy::Weighted => "weighted",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a strategy knows about one eligible agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent_id: AgentId,
    pub load: f64,
    /// Historical performance in [0, 1].
    pub performance: f64,
    /// Advertised capabilities the task does not need.
    pub extra_capabilities: usize,
    /// Total advertised capabilities.
    pub capability_count: usize,
    pub capacity: ResourceSpec,
    /// Allocatable amount left under the safety margin.
    pub headroom: ResourceSpec,
}

impl Candidate {
    /// Share of the agent's capabilities the task actually uses.
    pub fn capability_match(&self) -> f64 {
        if self.capability_count == 0 {
            1.0
        } else {
            (self.capability_count - self.extra_capabilities) as f64 / self.capability_count as f64
        }
    }

    fn fits(&self, requirements: &ResourceSpec) -> bool {
        ResourceKind::ALL
            .iter()
            .all(|k| requirements.get(*k) <= self.headroom.get(*k) + 1e-9)
    }
}

/// One entry of a strategy's preference order.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub agent_id: AgentId,
    /// Strategy fitness normalized to [0, 1].
    pub confidence: f64,
}

fn by_id(a: &Candidate, b: &Candidate) -> Ordering {
    a.agent_id.cmp(&b.agent_id)
}

fn by_load(a: &Candidate, b: &Candidate) -> Ordering {
    a.load.total_cmp(&b.load).then_with(|| by_id(a, b))
}

fn load_confidence(c: &Candidate) -> f64 {
    (1.0 - c.load).clamp(0.0, 1.0)
}

/// The dimension the task needs most relative to what candidates offer.
pub fn dominant_resource(requirements: &ResourceSpec, candidates: &[Candidate]) -> Option<ResourceKind> {
    ResourceKind::ALL
        .into_iter()
        .filter(|k| requirements.get(*k) > 0.0)
        .map(|k| {
            let best = candidates
                .iter()
                .map(|c| c.capacity.get(k))
                .fold(0.0, f64::max);
            let pressure = if best > 0.0 {
                requirements.get(k) / best
            } else {
                f64::INFINITY
            };
            (k, pressure)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(k, _)| k)
}

/// Order `candidates` by preference under `strategy`.
///
/// `round_robin_after` is the agent that received the previous
/// round-robin assignment for this capability class; the order starts at
/// the next agent id after it, wrapping. `ResourceBased` drops candidates
/// that cannot fit `requirements`.
pub fn rank(
    strategy: Strategy,
    candidates: &[Candidate],
    requirements: &ResourceSpec,
    weights: &StrategyWeights,
    round_robin_after: Option<&str>,
) -> Vec<Ranked> {
    let mut pool: Vec<&Candidate> = candidates.iter().collect();

    match strategy {
        Strategy::RoundRobin => {
            pool.sort_by(|a, b| by_id(a, b));
            let start = round_robin_after
                .and_then(|last| pool.iter().position(|c| c.agent_id.as_str() > last))
                .unwrap_or(0);
            pool.rotate_left(start);
            pool.into_iter()
                .map(|c| Ranked {
                    agent_id: c.agent_id.clone(),
                    confidence: load_confidence(c),
                })
                .collect()
        }
        Strategy::LeastLoaded => {
            pool.sort_by(|a, b| by_load(a, b));
            pool.into_iter()
                .map(|c| Ranked {
                    agent_id: c.agent_id.clone(),
                    confidence: load_confidence(c),
                })
                .collect()
        }
        Strategy::ResourceBased => {
            pool.retain(|c| c.fits(requirements));
            let Some(kind) = dominant_resource(requirements, candidates) else {
                // Nothing requested: fall back to the least loaded agent.
                pool.sort_by(|a, b| by_load(a, b));
                return pool
                    .into_iter()
                    .map(|c| Ranked {
                        agent_id: c.agent_id.clone(),
                        confidence: load_confidence(c),
                    })
                    .collect();
            };
            pool.sort_by(|a, b| {
                b.headroom
                    .get(kind)
                    .total_cmp(&a.headroom.get(kind))
                    .then_with(|| by_id(a, b))
            });
            pool.into_iter()
                .map(|c| {
                    let capacity = c.capacity.get(kind);
                    let confidence = if capacity > 0.0 {
                        ((c.headroom.get(kind) - requirements.get(kind)) / capacity).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    Ranked {
                        agent_id: c.agent_id.clone(),
                        confidence,
                    }
                })
                .collect()
        }
        Strategy::CapabilityBased => {
            pool.sort_by(|a, b| {
                a.extra_capabilities
                    .cmp(&b.extra_capabilities)
                    .then_with(|| by_load(a, b))
            });
            pool.into_iter()
                .map(|c| Ranked {
                    agent_id: c.agent_id.clone(),
                    confidence: 1.0 / (1.0 + c.extra_capabilities as f64),
                })
                .collect()
        }
        Strategy::Weighted => {
            let mut scored: Vec<(f64, &Candidate)> = pool
                .into_iter()
                .map(|c| (weighted_score(c, weights), c))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| by_id(a.1, b.1)));
            scored
                .into_iter()
                .map(|(score, c)| Ranked {
                    agent_id: c.agent_id.clone(),
                    confidence: score.clamp(0.0, 1.0),
                })
                .collect()
        }
    }
}

/// `w1 * (1 - load) + w2 * performance + w3 * capability_match`.
pub fn weighted_score(c: &Candidate, weights: &StrategyWeights) -> f64 {
    weights.load * (1.0 - c.load).clamp(0.0, 1.0)
        + weights.performance * c.performance.clamp(0.0, 1.0)
        + weights.capability * c.capability_match()
}
