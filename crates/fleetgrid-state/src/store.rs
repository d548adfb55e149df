//! Durable store: redb-backed persistence for FleetGrid.
//!
//! [`DurableStore`] is the interface the hybrid layer drives; [`StateStore`]
//! implements it over redb. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Every method is synchronous and runs inside a single redb transaction,
//! so each call either commits entirely or not at all.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Transactional persistence for agents, tasks, assignments, and allocations.
pub trait DurableStore: Send + Sync {
    /// Cheap round trip used by health checks.
    fn ping(&self) -> StateResult<()>;

    /// Insert a new agent; fails with `Duplicate` if the id is taken.
    fn insert_agent(&self, agent: &Agent) -> StateResult<()>;
    fn put_agent(&self, agent: &Agent) -> StateResult<()>;
    fn get_agent(&self, id: &str) -> StateResult<Option<Agent>>;
    fn list_agents(&self) -> StateResult<Vec<Agent>>;
    /// Delete an agent and its allocation rows. Returns true if it existed.
    fn delete_agent(&self, id: &str) -> StateResult<bool>;

    fn put_task(&self, task: &Task) -> StateResult<()>;
    fn get_task(&self, id: &str) -> StateResult<Option<Task>>;
    fn list_tasks(&self) -> StateResult<Vec<Task>>;
    fn delete_task(&self, id: &str) -> StateResult<bool>;

    /// Atomically mark a task `Assigned` and record the assignment.
    ///
    /// The assignment id is the idempotency key: re-committing an
    /// assignment the task already references returns the stored task
    /// unchanged. With `supersedes`, the task must currently reference
    /// that assignment (reassignment); otherwise it must be `Pending`.
    fn commit_assignment(
        &self,
        task: &Task,
        assignment: &TaskAssignment,
        supersedes: Option<&str>,
    ) -> StateResult<Task>;

    /// Undo a committed assignment that its caller abandoned.
    ///
    /// Only acts if the task still references `assignment_id`.
    fn revert_assignment(&self, task_id: &str, assignment_id: &str) -> StateResult<bool>;

    /// Move an active task held by `agent_id` back to `Pending`.
    fn requeue_task(&self, task_id: &str, agent_id: &str) -> StateResult<Option<Task>>;

    /// Assignment history for a task, oldest first.
    fn list_assignments(&self, task_id: &str) -> StateResult<Vec<TaskAssignment>>;

    /// Replace the allocation rows for an agent.
    fn put_allocations(&self, agent_id: &str, records: &[AllocationRecord]) -> StateResult<()>;
    fn list_allocations(&self, agent_id: &str) -> StateResult<Vec<AllocationRecord>>;

    /// Delete finished tasks last updated before `older_than` (epoch ms).
    fn purge_finished_tasks(&self, older_than: u64) -> StateResult<u32>;
}

/// Thread-safe durable store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "durable store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory durable store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(AGENTS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row helpers ────────────────────────────────────────

    fn read_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All rows whose key passes `keep`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, keep: impl Fn(&str) -> bool) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if keep(key.value()) {
                let row = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(row);
            }
        }
        Ok(results)
    }

    fn write_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Keys in `def` passing `keep`, collected in a read transaction.
    fn keys_where(&self, def: JsonTable, keep: impl Fn(&str) -> bool) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let keys = table
            .iter()
            .map_err(map_err!(Read))?
            .filter_map(|entry| {
                let (key, _) = entry.ok()?;
                let k = key.value().to_string();
                keep(&k).then_some(k)
            })
            .collect();
        Ok(keys)
    }
}

/// Task id of an `assignments` key (`{task_id}:{assigned_at}:{assignment_id}`).
///
/// Parsed from the right so ids containing `:` resolve to the exact owner.
fn assignment_owner(key: &str) -> Option<&str> {
    let mut parts = key.rsplitn(3, ':');
    parts.next()?;
    parts.next()?;
    parts.next()
}

/// Agent id of an `allocations` key (`{agent_id}:{resource}`).
fn allocation_owner(key: &str) -> Option<&str> {
    key.rsplit_once(':').map(|(owner, _)| owner)
}

/// Read and decode a task inside an open write transaction.
fn task_in_txn(txn: &redb::WriteTransaction, task_id: &str) -> StateResult<Option<Task>> {
    let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
    let raw = table
        .get(task_id)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec());
    match raw {
        Some(bytes) => Ok(Some(
            serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?,
        )),
        None => Ok(None),
    }
}

fn insert_in_txn<T: Serialize>(
    txn: &redb::WriteTransaction,
    def: JsonTable,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

impl DurableStore for StateStore {
    fn ping(&self) -> StateResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        txn.open_table(AGENTS).map_err(map_err!(Table))?;
        Ok(())
    }

    // ── Agents ─────────────────────────────────────────────────────

    fn insert_agent(&self, agent: &Agent) -> StateResult<()> {
        let bytes = serde_json::to_vec(agent).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            let exists = table.get(agent.id.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::Duplicate(agent.cache_key()));
            }
            table
                .insert(agent.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent_id = %agent.id, "agent inserted");
        Ok(())
    }

    fn put_agent(&self, agent: &Agent) -> StateResult<()> {
        self.write_json(AGENTS, &agent.id, agent)
    }

    fn get_agent(&self, id: &str) -> StateResult<Option<Agent>> {
        self.read_json(AGENTS, id)
    }

    fn list_agents(&self) -> StateResult<Vec<Agent>> {
        self.scan_json(AGENTS, |_| true)
    }

    fn delete_agent(&self, id: &str) -> StateResult<bool> {
        let allocation_keys = self.keys_where(ALLOCATIONS, |k| allocation_owner(k) == Some(id))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            existed = agents.remove(id).map_err(map_err!(Write))?.is_some();
            let mut allocations = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            for key in &allocation_keys {
                allocations.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent_id = %id, existed, "agent deleted");
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    fn put_task(&self, task: &Task) -> StateResult<()> {
        self.write_json(TASKS, &task.id, task)
    }

    fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        self.read_json(TASKS, id)
    }

    fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.scan_json(TASKS, |_| true)
    }

    fn delete_task(&self, id: &str) -> StateResult<bool> {
        self.remove_key(TASKS, id)
    }

    // ── Assignments ────────────────────────────────────────────────

    fn commit_assignment(
        &self,
        task: &Task,
        assignment: &TaskAssignment,
        supersedes: Option<&str>,
    ) -> StateResult<Task> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = task_in_txn(&txn, &task.id)?;

        if let Some(existing) = &current
            && existing.assignment_ref.as_deref() == Some(assignment.id.as_str())
        {
            // Retried write that already landed.
            return Ok(existing.clone());
        }

        let mut updated = current.unwrap_or_else(|| task.clone());
        match supersedes {
            Some(previous) => {
                if updated.status != TaskStatus::Assigned
                    || updated.assignment_ref.as_deref() != Some(previous)
                {
                    return Err(StateError::Conflict(format!(
                        "task {} no longer holds assignment {previous}",
                        updated.id
                    )));
                }
            }
            None => {
                if updated.status != TaskStatus::Pending {
                    return Err(StateError::Conflict(format!(
                        "task {} is {:?}, expected pending",
                        updated.id, updated.status
                    )));
                }
                updated.transition(TaskStatus::Assigned)?;
            }
        }
        updated.assigned_agent = Some(assignment.agent_id.clone());
        updated.assignment_ref = Some(assignment.id.clone());
        updated.updated_at = epoch_millis();

        insert_in_txn(&txn, TASKS, &updated.id, &updated)?;
        insert_in_txn(&txn, ASSIGNMENTS, &assignment.table_key(), assignment)?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            task_id = %updated.id,
            agent_id = %assignment.agent_id,
            assignment_id = %assignment.id,
            "assignment committed"
        );
        Ok(updated)
    }

    fn revert_assignment(&self, task_id: &str, assignment_id: &str) -> StateResult<bool> {
        let record_key = self
            .keys_where(ASSIGNMENTS, |k| assignment_owner(k) == Some(task_id))?
            .into_iter()
            .find(|k| k.ends_with(&format!(":{assignment_id}")));

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let Some(mut task) = task_in_txn(&txn, task_id)? else {
            return Ok(false);
        };
        if task.assignment_ref.as_deref() != Some(assignment_id) {
            return Ok(false);
        }
        task.transition(TaskStatus::Pending)?;
        insert_in_txn(&txn, TASKS, task_id, &task)?;
        if let Some(key) = record_key {
            let mut table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%task_id, %assignment_id, "assignment reverted");
        Ok(true)
    }

    fn requeue_task(&self, task_id: &str, agent_id: &str) -> StateResult<Option<Task>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let Some(mut task) = task_in_txn(&txn, task_id)? else {
            return Ok(None);
        };
        if !task.status.is_active() || task.assigned_agent.as_deref() != Some(agent_id) {
            return Ok(None);
        }
        task.transition(TaskStatus::Pending)?;
        insert_in_txn(&txn, TASKS, task_id, &task)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(task))
    }

    fn list_assignments(&self, task_id: &str) -> StateResult<Vec<TaskAssignment>> {
        self.scan_json(ASSIGNMENTS, |k| assignment_owner(k) == Some(task_id))
    }

    // ── Allocations ────────────────────────────────────────────────

    fn put_allocations(&self, agent_id: &str, records: &[AllocationRecord]) -> StateResult<()> {
        let stale = self.keys_where(ALLOCATIONS, |k| allocation_owner(k) == Some(agent_id))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for record in records {
                let bytes = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                table
                    .insert(record.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn list_allocations(&self, agent_id: &str) -> StateResult<Vec<AllocationRecord>> {
        self.scan_json(ALLOCATIONS, |k| allocation_owner(k) == Some(agent_id))
    }

    // ── Retention ──────────────────────────────────────────────────

    fn purge_finished_tasks(&self, older_than: u64) -> StateResult<u32> {
        let expired: Vec<String> = self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status.is_finished() && t.updated_at < older_than)
            .map(|t| t.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let mut history = Vec::new();
        for id in &expired {
            history.extend(self.keys_where(ASSIGNMENTS, |k| assignment_owner(k) == Some(id.as_str()))?);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            for id in &expired {
                tasks.remove(id.as_str()).map_err(map_err!(Write))?;
            }
            let mut assignments = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
            for key in &history {
                assignments.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(purged = expired.len(), "finished tasks purged");
        Ok(expired.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_agent(id: &str) -> Agent {
        Agent::new(id, "worker", ["backend"], ResourceSpec::new(8.0, 4096.0, 10240.0, 1000.0))
    }

    fn test_task(id: &str) -> Task {
        Task::new(id, "build", 5).with_requirements(ResourceSpec::new(1.0, 256.0, 0.0, 0.0))
    }

    #[test]
    fn agent_crud() {
        let store = test_store();
        store.insert_agent(&test_agent("a1")).unwrap();

        let got = store.get_agent("a1").unwrap().unwrap();
        assert_eq!(got.id, "a1");
        assert_eq!(store.list_agents().unwrap().len(), 1);

        let mut updated = got.clone();
        updated.status = AgentStatus::Busy;
        store.put_agent(&updated).unwrap();
        assert_eq!(store.get_agent("a1").unwrap().unwrap().status, AgentStatus::Busy);

        assert!(store.delete_agent("a1").unwrap());
        assert!(!store.delete_agent("a1").unwrap());
        assert!(store.get_agent("a1").unwrap().is_none());
    }

    #[test]
    fn insert_agent_rejects_duplicates() {
        let store = test_store();
        store.insert_agent(&test_agent("a1")).unwrap();
        let err = store.insert_agent(&test_agent("a1")).unwrap_err();
        assert!(matches!(err, StateError::Duplicate(_)));
    }

    #[test]
    fn commit_assignment_marks_task_assigned() {
        let store = test_store();
        let task = test_task("t1");
        store.put_task(&task).unwrap();

        let asg = TaskAssignment::new("t1", "a1", "alloc-1", "least_loaded", 1000, 0.8);
        let committed = store.commit_assignment(&task, &asg, None).unwrap();

        assert_eq!(committed.status, TaskStatus::Assigned);
        assert_eq!(committed.assigned_agent.as_deref(), Some("a1"));
        assert_eq!(store.list_assignments("t1").unwrap(), vec![asg]);
    }

    #[test]
    fn commit_assignment_is_idempotent_by_assignment_id() {
        let store = test_store();
        let task = test_task("t1");
        store.put_task(&task).unwrap();
        let asg = TaskAssignment::new("t1", "a1", "alloc-1", "least_loaded", 1000, 0.8);

        store.commit_assignment(&task, &asg, None).unwrap();
        let again = store.commit_assignment(&task, &asg, None).unwrap();

        assert_eq!(again.assignment_ref.as_deref(), Some(asg.id.as_str()));
        assert_eq!(store.list_assignments("t1").unwrap().len(), 1);
    }

    #[test]
    fn key_scans_match_exact_owner_ids() {
        let store = test_store();
        for id in ["a", "a:x"] {
            store.put_task(&test_task(id)).unwrap();
        }
        let asg = TaskAssignment::new("a:x", "a1", "alloc-1", "least_loaded", 1000, 0.8);
        store.commit_assignment(&test_task("a:x"), &asg, None).unwrap();
        assert!(store.list_assignments("a").unwrap().is_empty());
        assert_eq!(store.list_assignments("a:x").unwrap(), vec![asg]);

        let cpu = ResourceSpec::new(1.0, 0.0, 0.0, 0.0);
        store
            .put_allocations("n", &AllocationRecord::from_totals("n", &cpu))
            .unwrap();
        store
            .put_allocations("n:1", &AllocationRecord::from_totals("n:1", &cpu))
            .unwrap();

        // Replacing or deleting "n" leaves "n:1" alone.
        store.put_allocations("n", &[]).unwrap();
        assert!(store.list_allocations("n").unwrap().is_empty());
        assert!(!store.list_allocations("n:1").unwrap().is_empty());
        store.insert_agent(&test_agent("n")).unwrap();
        store.delete_agent("n").unwrap();
        assert!(!store.list_allocations("n:1").unwrap().is_empty());
    }

    #[test]
    fn second_assignment_conflicts() {
        let store = test_store();
        let task = test_task("t1");
        let first = TaskAssignment::new("t1", "a1", "alloc-1", "round_robin", 1000, 0.5);
        let second = TaskAssignment::new("t1", "a2", "alloc-2", "round_robin", 1000, 0.5);

        store.commit_assignment(&task, &first, None).unwrap();
        let err = store.commit_assignment(&task, &second, None).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn supersede_requires_current_reference() {
        let store = test_store();
        let task = test_task("t1");
        let first = TaskAssignment::new("t1", "a1", "alloc-1", "least_loaded", 1000, 0.5);
        store.commit_assignment(&task, &first, None).unwrap();

        let moved = TaskAssignment::new("t1", "a2", "alloc-2", "rebalance", 1000, 0.5);
        let task = store.commit_assignment(&task, &moved, Some(first.id.as_str())).unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("a2"));
        assert_eq!(store.list_assignments("t1").unwrap().len(), 2);

        let stale = TaskAssignment::new("t1", "a3", "alloc-3", "rebalance", 1000, 0.5);
        assert!(store.commit_assignment(&task, &stale, Some(first.id.as_str())).is_err());
    }

    #[test]
    fn revert_restores_pending_and_drops_record() {
        let store = test_store();
        let task = test_task("t1");
        let asg = TaskAssignment::new("t1", "a1", "alloc-1", "least_loaded", 1000, 0.5);
        store.commit_assignment(&task, &asg, None).unwrap();

        assert!(store.revert_assignment("t1", &asg.id).unwrap());
        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(store.list_assignments("t1").unwrap().is_empty());

        // Already reverted.
        assert!(!store.revert_assignment("t1", &asg.id).unwrap());
    }

    #[test]
    fn requeue_only_touches_tasks_of_that_agent() {
        let store = test_store();
        let task = test_task("t1");
        let asg = TaskAssignment::new("t1", "a1", "alloc-1", "least_loaded", 1000, 0.5);
        store.commit_assignment(&task, &asg, None).unwrap();

        assert!(store.requeue_task("t1", "other").unwrap().is_none());
        let requeued = store.requeue_task("t1", "a1").unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(store.requeue_task("t1", "a1").unwrap().is_none());
    }

    #[test]
    fn allocations_are_replaced_per_agent() {
        let store = test_store();
        let totals = ResourceSpec::new(2.0, 512.0, 0.0, 0.0);
        store
            .put_allocations("a1", &AllocationRecord::from_totals("a1", &totals))
            .unwrap();
        store
            .put_allocations("a2", &AllocationRecord::from_totals("a2", &totals))
            .unwrap();

        let half = totals.scale(0.5);
        store
            .put_allocations("a1", &AllocationRecord::from_totals("a1", &half))
            .unwrap();

        let rows = store.list_allocations("a1").unwrap();
        assert_eq!(rows.len(), 4);
        let cpu = rows.iter().find(|r| r.resource == ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.amount, 1.0);
        assert_eq!(store.list_allocations("a2").unwrap().len(), 4);
    }

    #[test]
    fn delete_agent_drops_allocation_rows() {
        let store = test_store();
        store.insert_agent(&test_agent("a1")).unwrap();
        store
            .put_allocations("a1", &AllocationRecord::from_totals("a1", &ResourceSpec::ZERO))
            .unwrap();

        store.delete_agent("a1").unwrap();
        assert!(store.list_allocations("a1").unwrap().is_empty());
    }

    #[test]
    fn purge_removes_only_old_finished_tasks() {
        let store = test_store();
        let mut done = test_task("done");
        done.status = TaskStatus::Completed;
        done.updated_at = 100;
        let mut fresh = test_task("fresh");
        fresh.status = TaskStatus::Failed;
        fresh.updated_at = 10_000;
        let mut pending = test_task("pending");
        pending.updated_at = 100;

        for t in [&done, &fresh, &pending] {
            store.put_task(t).unwrap();
        }

        assert_eq!(store.purge_finished_tasks(5_000).unwrap(), 1);
        assert!(store.get_task("done").unwrap().is_none());
        assert!(store.get_task("fresh").unwrap().is_some());
        assert!(store.get_task("pending").unwrap().is_some());
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.insert_agent(&test_agent("a1")).unwrap();
            store.put_task(&test_task("t1")).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_agent("a1").unwrap().is_some());
        assert!(store.get_task("t1").unwrap().is_some());
    }
}
