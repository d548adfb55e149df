//! Hybrid state facade.
//!
//! [`HybridState`] routes every call between the durable store, the cache
//! tier, and the work queue:
//!
//! - Reads are cache-first. A miss reads the durable store and fills the
//!   cache with the record's TTL; fill failures are ignored.
//! - Writes go to the durable store first. Only after the commit returns is
//!   the cache entry overwritten. A failed durable write never touches the
//!   cache.
//! - Durable calls run on the blocking pool, are retried on transient
//!   errors with exponential backoff, and are guarded by a circuit breaker.
//!   While the breaker is open writes fail fast and reads fall back to
//!   whatever the cache holds.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cache::{CacheBackend, MemoryCache};
use crate::error::{StateError, StateResult};
use crate::latency::LatencyWindow;
use crate::queue::{Delivery, EntryId, QueueStatus, TaskQueue};
use crate::store::{DurableStore, StateStore};
use crate::types::*;

const DURABLE: &str = "durable store";
const CACHE: &str = "cache";

/// Tuning for the state layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Cache lifetime of agent records.
    #[serde(with = "humantime_serde")]
    pub agent_ttl: Duration,
    /// Cache lifetime of task records.
    #[serde(with = "humantime_serde")]
    pub task_ttl: Duration,
    /// Idle time after which an unacknowledged queue entry may be claimed.
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,
    /// Total attempts for a durable call that keeps failing transiently.
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    pub breaker_failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub breaker_recovery_timeout: Duration,
    /// Cache hit ratio below which the health check warns.
    pub hit_ratio_target: f64,
    /// Lookups needed before the hit ratio is judged.
    pub hit_ratio_min_samples: u64,
    /// p95 durable latency above which the layer reports itself degraded.
    #[serde(with = "humantime_serde")]
    pub latency_budget: Duration,
    /// Age after which finished tasks are purged.
    #[serde(with = "humantime_serde")]
    pub task_retention: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            agent_ttl: Duration::from_secs(3600),
            task_ttl: Duration::from_secs(1800),
            pending_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(30),
            hit_ratio_target: 0.95,
            hit_ratio_min_samples: 100,
            latency_budget: Duration::from_millis(50),
            task_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Overall verdict of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Healthy,
    /// Durable store works, but the cache is out or latency is over budget.
    Degraded,
    /// Durable store unreachable.
    Unavailable,
}

/// Aggregated state-layer health, consumed by the coordinator and scaler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateHealthReport {
    pub status: StoreStatus,
    pub durable_reachable: bool,
    pub durable_circuit: CircuitState,
    pub cache_reachable: bool,
    pub cache_circuit: CircuitState,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_ratio: f64,
    pub p95_latency_ms: f64,
    pub checked_at: u64,
}

impl StateHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == StoreStatus::Healthy
    }
}

struct Inner {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn CacheBackend>,
    queue: TaskQueue,
    durable_breaker: CircuitBreaker,
    cache_breaker: CircuitBreaker,
    latency: LatencyWindow,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Keys whose cache entry may lag the durable record.
    stale: Mutex<HashSet<String>>,
    /// Orders read-path fills against write-path overwrites.
    fill_lock: Mutex<()>,
    write_epoch: AtomicU64,
    config: StateConfig,
}

/// Single state interface over the durable store, cache and queue.
#[derive(Clone)]
pub struct HybridState {
    inner: Arc<Inner>,
}

impl HybridState {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn CacheBackend>,
        config: StateConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                durable,
                cache,
                queue: TaskQueue::new(config.pending_timeout),
                durable_breaker: CircuitBreaker::new(
                    DURABLE,
                    config.breaker_failure_threshold,
                    config.breaker_recovery_timeout,
                ),
                cache_breaker: CircuitBreaker::new(
                    CACHE,
                    config.breaker_failure_threshold,
                    config.breaker_recovery_timeout,
                ),
                latency: LatencyWindow::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                stale: Mutex::new(HashSet::new()),
                fill_lock: Mutex::new(()),
                write_epoch: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// On-disk redb store at `path` with an in-process cache.
    pub fn open(path: &Path, config: StateConfig) -> StateResult<Self> {
        let store = StateStore::open(path)?;
        Ok(Self::new(Arc::new(store), Arc::new(MemoryCache::new()), config))
    }

    /// Fully in-memory layer for tests and ephemeral runs.
    pub fn in_memory(config: StateConfig) -> StateResult<Self> {
        let store = StateStore::open_in_memory()?;
        Ok(Self::new(Arc::new(store), Arc::new(MemoryCache::new()), config))
    }

    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Persist a new agent, failing with `Duplicate` if the id is taken.
    pub async fn register_agent(&self, agent: &Agent) -> StateResult<()> {
        let record = agent.clone();
        self.durable("insert_agent", move |s| s.insert_agent(&record))
            .await?;
        self.overwrite_cache(&agent.cache_key(), agent, self.inner.config.agent_ttl);
        Ok(())
    }

    pub async fn get_agent_state(&self, id: &str) -> StateResult<Option<Agent>> {
        let owned = id.to_string();
        self.read_through(
            "get_agent",
            agent_key(id),
            self.inner.config.agent_ttl,
            move |s| s.get_agent(&owned),
        )
        .await
    }

    pub async fn set_agent_state(&self, agent: &Agent) -> StateResult<()> {
        let record = agent.clone();
        self.durable("put_agent", move |s| s.put_agent(&record)).await?;
        self.overwrite_cache(&agent.cache_key(), agent, self.inner.config.agent_ttl);
        Ok(())
    }

    pub async fn delete_agent(&self, id: &str) -> StateResult<bool> {
        let owned = id.to_string();
        let removed = self
            .durable("delete_agent", move |s| s.delete_agent(&owned))
            .await?;
        self.drop_cache(&agent_key(id));
        Ok(removed)
    }

    pub async fn list_agents(&self) -> StateResult<Vec<Agent>> {
        self.durable("list_agents", |s| s.list_agents()).await
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub async fn get_task_state(&self, id: &str) -> StateResult<Option<Task>> {
        let owned = id.to_string();
        self.read_through(
            "get_task",
            task_key(id),
            self.inner.config.task_ttl,
            move |s| s.get_task(&owned),
        )
        .await
    }

    pub async fn set_task_state(&self, task: &Task) -> StateResult<()> {
        let record = task.clone();
        self.durable("put_task", move |s| s.put_task(&record)).await?;
        self.overwrite_cache(&task.cache_key(), task, self.inner.config.task_ttl);
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> StateResult<bool> {
        let owned = id.to_string();
        let removed = self
            .durable("delete_task", move |s| s.delete_task(&owned))
            .await?;
        self.drop_cache(&task_key(id));
        Ok(removed)
    }

    pub async fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.durable("list_tasks", |s| s.list_tasks()).await
    }

    /// Commit an assignment durably, bounded by `deadline`.
    ///
    /// On timeout the call returns [`StateError::Timeout`] and a background
    /// task waits for the in-flight write; if it landed anyway, the
    /// assignment is reverted so the task ends up `Pending`.
    pub async fn commit_assignment(
        &self,
        task: &Task,
        assignment: &TaskAssignment,
        supersedes: Option<String>,
        deadline: Duration,
    ) -> StateResult<Task> {
        let this = self.clone();
        let (record, asg) = (task.clone(), assignment.clone());
        let mut write = tokio::spawn(async move {
            this.durable("commit_assignment", move |s| {
                s.commit_assignment(&record, &asg, supersedes.as_deref())
            })
            .await
        });

        match tokio::time::timeout(deadline, &mut write).await {
            Ok(joined) => {
                let committed = joined
                    .map_err(|e| StateError::Transaction(format!("assignment commit aborted: {e}")))??;
                self.overwrite_cache(&committed.cache_key(), &committed, self.inner.config.task_ttl);
                Ok(committed)
            }
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    assignment_id = %assignment.id,
                    ?deadline,
                    "assignment commit exceeded deadline"
                );
                let this = self.clone();
                let (task_id, assignment_id) = (task.id.clone(), assignment.id.clone());
                tokio::spawn(async move {
                    if let Ok(Ok(_)) = write.await {
                        this.compensate(task_id, assignment_id).await;
                    }
                });
                Err(StateError::Timeout("assignment commit"))
            }
        }
    }

    async fn compensate(&self, task_id: TaskId, assignment_id: String) {
        let (tid, aid) = (task_id.clone(), assignment_id.clone());
        match self
            .durable("revert_assignment", move |s| s.revert_assignment(&tid, &aid))
            .await
        {
            Ok(true) => {
                self.drop_cache(&task_key(&task_id));
                info!(%task_id, %assignment_id, "late assignment commit reverted");
            }
            Ok(false) => {}
            Err(e) => warn!(%task_id, %assignment_id, error = %e, "failed to revert late assignment"),
        }
    }

    pub async fn revert_assignment(&self, task_id: &str, assignment_id: &str) -> StateResult<bool> {
        let (tid, aid) = (task_id.to_string(), assignment_id.to_string());
        let reverted = self
            .durable("revert_assignment", move |s| s.revert_assignment(&tid, &aid))
            .await?;
        if reverted {
            self.drop_cache(&task_key(task_id));
        }
        Ok(reverted)
    }

    /// Return an active task held by `agent_id` to `Pending`.
    pub async fn requeue_task(&self, task_id: &str, agent_id: &str) -> StateResult<Option<Task>> {
        let (tid, aid) = (task_id.to_string(), agent_id.to_string());
        let requeued = self
            .durable("requeue_task", move |s| s.requeue_task(&tid, &aid))
            .await?;
        if let Some(task) = &requeued {
            self.overwrite_cache(&task.cache_key(), task, self.inner.config.task_ttl);
        }
        Ok(requeued)
    }

    pub async fn list_assignments(&self, task_id: &str) -> StateResult<Vec<TaskAssignment>> {
        let owned = task_id.to_string();
        self.durable("list_assignments", move |s| s.list_assignments(&owned))
            .await
    }

    /// Delete finished tasks whose last update is older than `retention`.
    pub async fn purge_finished_tasks(&self, retention: Duration) -> StateResult<u32> {
        let cutoff = epoch_millis().saturating_sub(retention.as_millis() as u64);
        let doomed: Vec<TaskId> = self
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.status.is_finished() && t.updated_at < cutoff)
            .map(|t| t.id)
            .collect();
        let purged = self
            .durable("purge_finished_tasks", move |s| s.purge_finished_tasks(cutoff))
            .await?;
        for id in &doomed {
            self.drop_cache(&task_key(id));
        }
        Ok(purged)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Mirror an agent's ledger totals into the allocations table.
    pub async fn sync_allocations(&self, agent_id: &str, totals: &ResourceSpec) -> StateResult<()> {
        let owned = agent_id.to_string();
        let records = AllocationRecord::from_totals(agent_id, totals);
        self.durable("put_allocations", move |s| s.put_allocations(&owned, &records))
            .await
    }

    pub async fn list_allocations(&self, agent_id: &str) -> StateResult<Vec<AllocationRecord>> {
        let owned = agent_id.to_string();
        self.durable("list_allocations", move |s| s.list_allocations(&owned))
            .await
    }

    // ── Work queue ─────────────────────────────────────────────────

    /// Append a task to the pending stream of the pool named by its type.
    pub fn queue_task(&self, task: &Task) -> StateResult<EntryId> {
        let payload = serde_json::to_vec(task).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.inner
            .queue
            .append(&pending_stream_key(&task.task_type), &task.id, payload)
    }

    pub fn create_consumer_group(&self, agent_type: &str, group: &str) -> StateResult<bool> {
        self.inner
            .queue
            .create_group(&pending_stream_key(agent_type), group)
    }

    pub fn read_queue(
        &self,
        agent_type: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StateResult<Vec<Delivery>> {
        self.inner
            .queue
            .read_group(&pending_stream_key(agent_type), group, consumer, count)
    }

    pub fn ack_queued(&self, agent_type: &str, group: &str, entry_id: EntryId) -> StateResult<bool> {
        self.inner
            .queue
            .ack(&pending_stream_key(agent_type), group, entry_id)
    }

    pub fn claim_stale(
        &self,
        agent_type: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StateResult<Vec<Delivery>> {
        self.inner
            .queue
            .claim_stale(&pending_stream_key(agent_type), group, consumer, count)
    }

    pub fn get_queue_status(&self, agent_type: &str) -> StateResult<QueueStatus> {
        self.inner.queue.status(&pending_stream_key(agent_type))
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Fraction of cache-first reads served from the cache; 1.0 before any read.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            1.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    pub async fn health_check(&self) -> StateHealthReport {
        let inner = &self.inner;
        let durable_reachable = self.durable("ping", |s| s.ping()).await.is_ok();
        let cache_reachable = inner.cache_breaker.allow()
            && match inner.cache.ping() {
                Ok(()) => {
                    inner.cache_breaker.record_success();
                    true
                }
                Err(_) => {
                    inner.cache_breaker.record_failure();
                    false
                }
            };

        let cache_hits = inner.hits.load(Ordering::Relaxed);
        let cache_misses = inner.misses.load(Ordering::Relaxed);
        let hit_ratio = self.hit_ratio();
        if cache_hits + cache_misses >= inner.config.hit_ratio_min_samples
            && hit_ratio < inner.config.hit_ratio_target
        {
            warn!(
                hit_ratio,
                target = inner.config.hit_ratio_target,
                "cache hit ratio below target"
            );
        }

        let p95_latency_ms = inner.latency.p95_ms();
        let over_budget = p95_latency_ms > inner.config.latency_budget.as_secs_f64() * 1000.0;
        let status = if !durable_reachable {
            StoreStatus::Unavailable
        } else if !cache_reachable || over_budget {
            StoreStatus::Degraded
        } else {
            StoreStatus::Healthy
        };

        StateHealthReport {
            status,
            durable_reachable,
            durable_circuit: inner.durable_breaker.state(),
            cache_reachable,
            cache_circuit: inner.cache_breaker.state(),
            cache_hits,
            cache_misses,
            hit_ratio,
            p95_latency_ms,
            checked_at: epoch_millis(),
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Run a durable-store call on the blocking pool with retry and breaker.
    async fn durable<T, F>(&self, op: &'static str, call: F) -> StateResult<T>
    where
        T: Send + 'static,
        F: Fn(&dyn DurableStore) -> StateResult<T> + Clone + Send + 'static,
    {
        let inner = &self.inner;
        let attempts = inner.config.retry_attempts.max(1);
        let mut backoff = inner.config.retry_backoff;
        let mut attempt = 1;
        loop {
            if !inner.durable_breaker.allow() {
                debug!(op, "durable call rejected, circuit open");
                return Err(StateError::Unavailable(DURABLE));
            }

            let store = Arc::clone(&inner.durable);
            let f = call.clone();
            let started = Instant::now();
            let result = match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
                Ok(result) => result,
                Err(e) => Err(StateError::Transaction(format!("{op} aborted: {e}"))),
            };
            inner.latency.record(started.elapsed());

            match result {
                Err(e) if e.is_transient() => {
                    inner.durable_breaker.record_failure();
                    if attempt >= attempts {
                        warn!(op, attempt, error = %e, "durable call failed");
                        return Err(e);
                    }
                    debug!(op, attempt, error = %e, "transient durable failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                // Logical errors still prove the store is reachable.
                other => {
                    inner.durable_breaker.record_success();
                    return other;
                }
            }
        }
    }

    async fn read_through<T, F>(
        &self,
        op: &'static str,
        key: String,
        ttl: Duration,
        call: F,
    ) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&dyn DurableStore) -> StateResult<Option<T>> + Clone + Send + 'static,
    {
        if !self.is_stale(&key)
            && let Some(bytes) = self.cache_get(&key)
        {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(value));
                }
                Err(e) => {
                    debug!(%key, error = %e, "undecodable cache entry dropped");
                    let _ = self.cache_invalidate(&key);
                }
            }
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        let epoch = self.inner.write_epoch.load(Ordering::SeqCst);
        match self.durable(op, call).await {
            Ok(Some(value)) => {
                self.fill_cache(&key, &value, ttl, epoch);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(StateError::Unavailable(what)) => {
                let cached = self
                    .cache_get(&key)
                    .and_then(|bytes| serde_json::from_slice(&bytes).ok());
                match cached {
                    Some(value) => {
                        warn!(%key, "durable store unavailable, serving cached value");
                        Ok(Some(value))
                    }
                    None => Err(StateError::Unavailable(what)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = &self.inner;
        if !inner.cache_breaker.allow() {
            return None;
        }
        match inner.cache.get(key) {
            Ok(value) => {
                inner.cache_breaker.record_success();
                value
            }
            Err(e) => {
                inner.cache_breaker.record_failure();
                debug!(%key, error = %e, "cache read failed");
                None
            }
        }
    }

    fn cache_set(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> StateResult<()> {
        let inner = &self.inner;
        if !inner.cache_breaker.allow() {
            return Err(StateError::Unavailable(CACHE));
        }
        match inner.cache.set(key, bytes, ttl) {
            Ok(()) => {
                inner.cache_breaker.record_success();
                Ok(())
            }
            Err(e) => {
                inner.cache_breaker.record_failure();
                Err(e)
            }
        }
    }

    fn cache_invalidate(&self, key: &str) -> StateResult<()> {
        let inner = &self.inner;
        if !inner.cache_breaker.allow() {
            return Err(StateError::Unavailable(CACHE));
        }
        match inner.cache.invalidate(key) {
            Ok(()) => {
                inner.cache_breaker.record_success();
                Ok(())
            }
            Err(e) => {
                inner.cache_breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Populate the cache after a miss unless a write landed meanwhile.
    fn fill_cache<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, epoch: u64) {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        let _guard = self.inner.fill_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.write_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if self.cache_set(key, bytes, ttl).is_ok() {
            self.clear_stale(key);
        }
    }

    /// Write-path cache update after a durable commit.
    ///
    /// Must complete: if the entry cannot be overwritten it is invalidated,
    /// and if that fails too the key is marked stale so reads bypass it.
    fn overwrite_cache<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let _guard = self.inner.fill_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.write_epoch.fetch_add(1, Ordering::SeqCst);

        if let Ok(bytes) = serde_json::to_vec(value) {
            for _ in 0..self.inner.config.retry_attempts.max(1) {
                if self.cache_set(key, bytes.clone(), ttl).is_ok() {
                    self.clear_stale(key);
                    return;
                }
            }
        }
        warn!(%key, "cache overwrite failed after durable write");
        self.invalidate_or_mark(key);
    }

    fn drop_cache(&self, key: &str) {
        let _guard = self.inner.fill_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.write_epoch.fetch_add(1, Ordering::SeqCst);
        self.invalidate_or_mark(key);
    }

    fn invalidate_or_mark(&self, key: &str) {
        for _ in 0..self.inner.config.retry_attempts.max(1) {
            if self.cache_invalidate(key).is_ok() {
                self.clear_stale(key);
                return;
            }
        }
        if let Ok(mut stale) = self.inner.stale.lock() {
            stale.insert(key.to_string());
        }
    }

    fn is_stale(&self, key: &str) -> bool {
        self.inner
            .stale
            .lock()
            .map(|stale| stale.contains(key))
            .unwrap_or(true)
    }

    fn clear_stale(&self, key: &str) {
        if let Ok(mut stale) = self.inner.stale.lock() {
            stale.remove(key);
        }
    }
}
