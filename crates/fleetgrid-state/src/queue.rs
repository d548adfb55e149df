//! Work queue: append-only task streams with consumer groups.
//!
//! Each stream (`tasks:pending:{agent_type}`) holds entries in id order.
//! A consumer group tracks the last entry it handed out and a pending list
//! of delivered-but-unacknowledged entries. An entry left pending longer
//! than `pending_timeout` can be claimed by another consumer in the group,
//! so delivery is at-least-once: consumers must tolerate duplicates or
//! deduplicate on `task_id`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::TaskId;

/// Stream entry id. Ids start at 1 and increase monotonically per stream.
pub type EntryId = u64;

#[derive(Debug, Clone)]
struct StreamEntry {
    task_id: TaskId,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, StreamEntry>,
    last_id: EntryId,
    groups: HashMap<String, ConsumerGroup>,
    redeliveries: u64,
}

impl Stream {
    /// Drop entries every group has delivered and acknowledged.
    fn trim(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let floor = self
            .groups
            .values()
            .map(|g| {
                let oldest_pending = g.pending.keys().next().map(|id| id - 1);
                oldest_pending.unwrap_or(g.last_delivered).min(g.last_delivered)
            })
            .min()
            .unwrap_or(0);
        self.entries.retain(|id, _| *id > floor);
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub stream: String,
    pub entry_id: EntryId,
    pub task_id: TaskId,
    pub payload: Vec<u8>,
    pub consumer: String,
    /// 1 on first delivery, incremented on every claim.
    pub delivery_count: u32,
}

impl Delivery {
    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> StateResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

/// Per-group view in [`QueueStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub name: String,
    /// Delivered but unacknowledged entries.
    pub pending: usize,
    /// Entries not yet delivered to any consumer of the group.
    pub lag: usize,
}

/// Point-in-time view of one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub stream: String,
    /// Entries retained in the stream.
    pub length: usize,
    pub groups: Vec<GroupStatus>,
    /// Claims of stale pending entries since the stream was created.
    pub redeliveries: u64,
}

/// In-process stream store with consumer-group semantics.
pub struct TaskQueue {
    streams: Mutex<HashMap<String, Stream>>,
    pending_timeout: Duration,
}

fn poisoned<T>(_: T) -> StateError {
    StateError::Cache("queue lock poisoned".to_string())
}

impl TaskQueue {
    pub fn new(pending_timeout: Duration) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            pending_timeout,
        }
    }

    /// Append an entry, creating the stream if needed.
    pub fn append(&self, stream: &str, task_id: &str, payload: Vec<u8>) -> StateResult<EntryId> {
        let mut streams = self.streams.lock().map_err(poisoned)?;
        let s = streams.entry(stream.to_string()).or_default();
        s.last_id += 1;
        let id = s.last_id;
        s.entries.insert(
            id,
            StreamEntry {
                task_id: task_id.to_string(),
                payload,
            },
        );
        debug!(%stream, %task_id, entry_id = id, "entry appended");
        Ok(id)
    }

    /// Create a consumer group reading from the start of the stream.
    ///
    /// Returns false if the group already existed.
    pub fn create_group(&self, stream: &str, group: &str) -> StateResult<bool> {
        let mut streams = self.streams.lock().map_err(poisoned)?;
        let s = streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(false);
        }
        s.groups.insert(group.to_string(), ConsumerGroup::default());
        Ok(true)
    }

    /// Deliver up to `count` never-delivered entries to `consumer`.
    pub fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StateResult<Vec<Delivery>> {
        let mut streams = self.streams.lock().map_err(poisoned)?;
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| StateError::NotFound(format!("stream {stream}")))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| StateError::NotFound(format!("group {group} on {stream}")))?;

        let now = Instant::now();
        let mut out = Vec::new();
        for (id, entry) in s.entries.range(g.last_delivered + 1..).take(count) {
            g.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            out.push(Delivery {
                stream: stream.to_string(),
                entry_id: *id,
                task_id: entry.task_id.clone(),
                payload: entry.payload.clone(),
                consumer: consumer.to_string(),
                delivery_count: 1,
            });
        }
        if let Some(last) = out.last() {
            g.last_delivered = last.entry_id;
        }
        Ok(out)
    }

    /// Acknowledge an entry. Returns false if it was not pending.
    pub fn ack(&self, stream: &str, group: &str, entry_id: EntryId) -> StateResult<bool> {
        let mut streams = self.streams.lock().map_err(poisoned)?;
        let Some(s) = streams.get_mut(stream) else {
            return Ok(false);
        };
        let acked = s
            .groups
            .get_mut(group)
            .map(|g| g.pending.remove(&entry_id).is_some())
            .unwrap_or(false);
        if acked {
            s.trim();
        }
        Ok(acked)
    }

    /// Transfer entries idle longer than the pending timeout to `consumer`.
    ///
    /// Each claim resets the idle clock, so a stale entry is handed out
    /// once per timeout window.
    pub fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StateResult<Vec<Delivery>> {
        let mut streams = self.streams.lock().map_err(poisoned)?;
        let Some(s) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Err(StateError::NotFound(format!("group {group} on {stream}")));
        };

        let now = Instant::now();
        let mut out = Vec::new();
        for (id, pending) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < self.pending_timeout {
                continue;
            }
            let Some(entry) = s.entries.get(id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            out.push(Delivery {
                stream: stream.to_string(),
                entry_id: *id,
                task_id: entry.task_id.clone(),
                payload: entry.payload.clone(),
                consumer: consumer.to_string(),
                delivery_count: pending.delivery_count,
            });
        }
        s.redeliveries += out.len() as u64;
        if !out.is_empty() {
            debug!(%stream, %group, %consumer, claimed = out.len(), "stale entries claimed");
        }
        Ok(out)
    }

    /// Consumers currently holding each pending entry of a group.
    pub fn pending_owners(&self, stream: &str, group: &str) -> StateResult<Vec<(EntryId, String)>> {
        let streams = self.streams.lock().map_err(poisoned)?;
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| (*id, p.consumer.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn status(&self, stream: &str) -> StateResult<QueueStatus> {
        let streams = self.streams.lock().map_err(poisoned)?;
        let Some(s) = streams.get(stream) else {
            return Ok(QueueStatus {
                stream: stream.to_string(),
                length: 0,
                groups: Vec::new(),
                redeliveries: 0,
            });
        };
        let mut groups: Vec<GroupStatus> = s
            .groups
            .iter()
            .map(|(name, g)| GroupStatus {
                name: name.clone(),
                pending: g.pending.len(),
                lag: s.entries.range(g.last_delivered + 1..).count(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(QueueStatus {
            stream: stream.to_string(),
            length: s.entries.len(),
            groups,
            redeliveries: s.redeliveries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "tasks:pending:backend";
    const GROUP: &str = "backend-pool";

    fn queue_with_entries(n: usize) -> TaskQueue {
        let q = TaskQueue::new(Duration::from_secs(60));
        q.create_group(STREAM, GROUP).unwrap();
        for i in 0..n {
            q.append(STREAM, &format!("t{i}"), Vec::new()).unwrap();
        }
        q
    }

    #[test]
    fn each_entry_delivered_once_per_group() {
        let q = queue_with_entries(3);

        let first = q.read_group(STREAM, GROUP, "c1", 2).unwrap();
        let second = q.read_group(STREAM, GROUP, "c2", 10).unwrap();

        assert_eq!(
            first.iter().map(|d| d.task_id.as_str()).collect::<Vec<_>>(),
            vec!["t0", "t1"]
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].task_id, "t2");
        assert!(q.read_group(STREAM, GROUP, "c1", 10).unwrap().is_empty());
    }

    #[test]
    fn read_from_unknown_group_fails() {
        let q = queue_with_entries(1);
        assert!(q.read_group(STREAM, "nope", "c1", 1).is_err());
    }

    #[test]
    fn ack_clears_pending_and_trims() {
        let q = queue_with_entries(2);
        let delivered = q.read_group(STREAM, GROUP, "c1", 2).unwrap();

        assert!(q.ack(STREAM, GROUP, delivered[0].entry_id).unwrap());
        assert!(!q.ack(STREAM, GROUP, delivered[0].entry_id).unwrap());

        let status = q.status(STREAM).unwrap();
        assert_eq!(status.length, 1);
        assert_eq!(status.groups[0].pending, 1);
        assert_eq!(status.groups[0].lag, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_entry_is_redelivered_once_after_timeout() {
        let q = TaskQueue::new(Duration::from_secs(30));
        q.create_group(STREAM, GROUP).unwrap();
        q.append(STREAM, "t1", b"payload".to_vec()).unwrap();

        let first = q.read_group(STREAM, GROUP, "c1", 1).unwrap();
        assert_eq!(first[0].delivery_count, 1);

        // Not yet stale.
        assert!(q.claim_stale(STREAM, GROUP, "c2", 10).unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let claimed = q.claim_stale(STREAM, GROUP, "c2", 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task_id, "t1");
        assert_eq!(claimed[0].consumer, "c2");
        assert_eq!(claimed[0].delivery_count, 2);

        // The claim reset the idle clock: nobody else gets it right away.
        assert!(q.claim_stale(STREAM, GROUP, "c3", 10).unwrap().is_empty());
        assert_eq!(q.status(STREAM).unwrap().redeliveries, 1);
        assert_eq!(q.pending_owners(STREAM, GROUP).unwrap(), vec![(1, "c2".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_entry_is_never_redelivered() {
        let q = TaskQueue::new(Duration::from_secs(30));
        q.create_group(STREAM, GROUP).unwrap();
        q.append(STREAM, "t1", Vec::new()).unwrap();

        let d = q.read_group(STREAM, GROUP, "c1", 1).unwrap();
        q.ack(STREAM, GROUP, d[0].entry_id).unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(q.claim_stale(STREAM, GROUP, "c2", 10).unwrap().is_empty());
    }

    #[test]
    fn groups_consume_independently() {
        let q = queue_with_entries(1);
        q.create_group(STREAM, "audit").unwrap();

        assert_eq!(q.read_group(STREAM, GROUP, "c1", 5).unwrap().len(), 1);
        assert_eq!(q.read_group(STREAM, "audit", "c9", 5).unwrap().len(), 1);
        assert!(!q.create_group(STREAM, "audit").unwrap());
    }

    #[test]
    fn status_of_unknown_stream_is_empty() {
        let q = TaskQueue::new(Duration::from_secs(30));
        let status = q.status("tasks:pending:none").unwrap();
        assert_eq!(status.length, 0);
        assert!(status.groups.is_empty());
    }
}
