//! Agent registry.
//!
//! Each agent lives in its own [`AgentSlot`] behind its own async mutex.
//! Health transitions and assignments to the same agent both hold that
//! mutex, so marking an agent unhealthy is linearizable with any in-flight
//! assignment to it. The membership map lock is only held to look slots up,
//! never across a durable-store call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};

use fleetgrid_state::{Agent, AgentId, AllocationId, ResourceSpec, TaskId};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::health::HeartbeatTracker;

/// Ledger and assignment references of a task an agent currently holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTask {
    pub allocation_id: AllocationId,
    pub assignment_id: String,
    pub requirements: ResourceSpec,
}

#[derive(Debug)]
pub struct AgentSlot {
    pub agent: Agent,
    pub tracker: HeartbeatTracker,
    pub active: BTreeMap<TaskId, ActiveTask>,
    /// Set once the agent is unregistered; holders of a stale `Arc` must back off.
    pub removed: bool,
    /// Chosen for termination; takes no new work.
    pub draining: bool,
}

impl AgentSlot {
    pub fn new(agent: Agent, failure_threshold: u32) -> Self {
        Self {
            agent,
            tracker: HeartbeatTracker::new(failure_threshold),
            active: BTreeMap::new(),
            removed: false,
            draining: false,
        }
    }

    /// Whether the agent may take new work.
    pub fn is_eligible(&self) -> bool {
        !self.removed && !self.draining && self.agent.status.is_eligible()
    }
}

pub type SlotRef = Arc<Mutex<AgentSlot>>;

#[derive(Default)]
struct Members {
    slots: HashMap<AgentId, SlotRef>,
    /// Ids whose registration is in progress.
    reserved: HashSet<AgentId>,
}

pub struct AgentRegistry {
    members: RwLock<Members>,
    max_agents: usize,
    live_tx: watch::Sender<HashSet<AgentId>>,
}

impl AgentRegistry {
    pub fn new(max_agents: usize) -> Self {
        let (live_tx, _) = watch::channel(HashSet::new());
        Self {
            members: RwLock::new(Members::default()),
            max_agents,
            live_tx,
        }
    }

    /// Claim an id for registration, enforcing uniqueness and the size limit.
    pub async fn reserve(&self, agent_id: &str) -> CoordinatorResult<()> {
        let mut members = self.members.write().await;
        if members.slots.contains_key(agent_id) || members.reserved.contains(agent_id) {
            return Err(CoordinatorError::DuplicateAgent(agent_id.to_string()));
        }
        if members.slots.len() + members.reserved.len() >= self.max_agents {
            return Err(CoordinatorError::CapacityExceeded {
                max: self.max_agents,
            });
        }
        members.reserved.insert(agent_id.to_string());
        self.publish(&members);
        Ok(())
    }

    /// Give up a reservation after a failed registration.
    pub async fn release(&self, agent_id: &str) {
        let mut members = self.members.write().await;
        if members.reserved.remove(agent_id) {
            self.publish(&members);
        }
    }

    /// Install a slot, consuming any reservation for its id.
    pub async fn insert(&self, slot: AgentSlot) -> SlotRef {
        let id = slot.agent.id.clone();
        let slot = Arc::new(Mutex::new(slot));
        let mut members = self.members.write().await;
        members.reserved.remove(&id);
        members.slots.insert(id, Arc::clone(&slot));
        self.publish(&members);
        slot
    }

    pub async fn remove(&self, agent_id: &str) -> Option<SlotRef> {
        let mut members = self.members.write().await;
        let slot = members.slots.remove(agent_id);
        if slot.is_some() {
            self.publish(&members);
        }
        slot
    }

    pub async fn get(&self, agent_id: &str) -> Option<SlotRef> {
        self.members.read().await.slots.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.members.read().await.slots.contains_key(agent_id)
    }

    /// All slots, sorted by agent id.
    pub async fn slots(&self) -> Vec<(AgentId, SlotRef)> {
        let mut slots: Vec<(AgentId, SlotRef)> = self
            .members
            .read()
            .await
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Point-in-time copy of every agent with its active task count, sorted by id.
    pub async fn snapshot(&self) -> Vec<(Agent, usize)> {
        let mut out = Vec::new();
        for (_, slot) in self.slots().await {
            let slot = slot.lock().await;
            if !slot.removed {
                out.push((slot.agent.clone(), slot.active.len()));
            }
        }
        out
    }

    /// Membership feed for collaborators that clean up after departed agents.
    ///
    /// Ids under registration are included: their ledgers open before
    /// their slots are installed.
    pub fn subscribe(&self) -> watch::Receiver<HashSet<AgentId>> {
        self.live_tx.subscribe()
    }

    fn publish(&self, members: &Members) {
        self.live_tx.send_replace(
            members
                .slots
                .keys()
                .chain(members.reserved.iter())
                .cloned()
                .collect(),
        );
    }
}
