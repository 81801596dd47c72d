//! Persistence boundary.
//!
//! The tracker never talks to a database directly. Every durable effect goes
//! through [`RecordSink`], and so do the two lookups handlers need (agent by
//! extension, queue by name). [`MemorySink`] is a complete in-process
//! implementation backed by a static [`Directory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::presence::AgentStatus;
use crate::records::{
    AgentCounters, AgentHistoryEntry, AgentId, AgentUpdate, CallRecord, QueueId, QueueRef,
    QueueStatsUpdate,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Backing store cannot be reached right now
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// Backing store refused the write
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Where records go.
///
/// Call records are keyed by `call_id` and must be upserted, so a redelivered
/// CDR overwrites rather than duplicates. Agent and queue updates carry
/// relative deltas; implementations apply them and floor counters at zero.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert_call(&self, record: &CallRecord) -> Result<(), SinkError>;

    /// Open (`ended_at == None`) or close a status interval. A close matches
    /// the open entry by agent and `started_at`.
    async fn append_or_close_agent_history(
        &self,
        entry: &AgentHistoryEntry,
    ) -> Result<(), SinkError>;

    async fn update_agent(&self, update: &AgentUpdate) -> Result<(), SinkError>;

    async fn upsert_queue_stats(&self, update: &QueueStatsUpdate) -> Result<(), SinkError>;

    /// Bump the per-member answered-call counter and its last-call time
    async fn record_member_call(
        &self,
        queue: QueueId,
        agent: AgentId,
        at: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    async fn find_agent_by_extension(&self, extension: &str)
        -> Result<Option<AgentId>, SinkError>;

    async fn find_queue_by_name(&self, name: &str) -> Result<Option<QueueRef>, SinkError>;
}

/// Static agent and queue lookup tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Directory {
    /// Extension → agent
    pub agents: HashMap<String, AgentId>,
    pub queues: Vec<QueueRef>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, extension: impl Into<String>, agent: AgentId) -> Self {
        self.agents.insert(extension.into(), agent);
        self
    }

    pub fn with_queue(mut self, queue: QueueRef) -> Self {
        self.queues.retain(|q| q.name != queue.name);
        self.queues.push(queue);
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SinkError::Unavailable(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| SinkError::Rejected(e.to_string()))
    }

    pub fn agent(&self, extension: &str) -> Option<AgentId> {
        self.agents.get(extension).copied()
    }

    pub fn queue(&self, name: &str) -> Option<&QueueRef> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// Agent row as the sink last saw it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRow {
    pub status: AgentStatus,
    pub current_calls: u32,
    pub logged_in_at: Option<DateTime<Utc>>,
    pub totals: AgentCounters,
}

/// Queue statistics row with deltas applied
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatsRow {
    pub calls_waiting: u64,
    pub calls_completed: u64,
    pub calls_abandoned: u64,
    pub service_level_met: u64,
    pub avg_wait_time: u64,
    pub avg_talk_time: u64,
    pub max_wait_time: u64,
    pub agents_available: u32,
    pub agents_busy: u32,
    pub service_level_percentage: f64,
}

impl QueueStatsRow {
    fn apply(&mut self, update: &QueueStatsUpdate) {
        let d = &update.deltas;
        self.calls_waiting = apply_delta(self.calls_waiting, d.calls_waiting);
        self.calls_completed = apply_delta(self.calls_completed, d.calls_completed);
        self.calls_abandoned = apply_delta(self.calls_abandoned, d.calls_abandoned);
        self.service_level_met = apply_delta(self.service_level_met, d.service_level_met);

        let g = &update.gauges;
        if let Some(v) = g.avg_wait_time {
            self.avg_wait_time = v;
        }
        if let Some(v) = g.avg_talk_time {
            self.avg_talk_time = v;
        }
        if let Some(v) = g.max_wait_time {
            self.max_wait_time = v;
        }
        if let Some(v) = g.agents_available {
            self.agents_available = v;
        }
        if let Some(v) = g.agents_busy {
            self.agents_busy = v;
        }
        if let Some(v) = g.service_level_percentage {
            self.service_level_percentage = v;
        }
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Per-member answered calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemberCalls {
    pub calls_taken: u64,
    pub last_call: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    calls: IndexMap<String, CallRecord>,
    call_writes: u64,
    history: Vec<AgentHistoryEntry>,
    agents: HashMap<AgentId, AgentRow>,
    queue_stats: HashMap<QueueId, QueueStatsRow>,
    member_calls: HashMap<(QueueId, AgentId), MemberCalls>,
}

/// In-process sink. Useful for tests, replays and the CLI.
#[derive(Debug, Default)]
pub struct MemorySink {
    directory: Directory,
    store: Mutex<MemoryStore>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            store: Mutex::new(MemoryStore::default()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// While set, every write fails with [`SinkError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SinkError::Unavailable("memory sink set to fail".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn call(&self, call_id: &str) -> Option<CallRecord> {
        self.store.lock().await.calls.get(call_id).cloned()
    }

    /// Call records in first-write order
    pub async fn calls(&self) -> Vec<CallRecord> {
        self.store.lock().await.calls.values().cloned().collect()
    }

    /// Number of `upsert_call` invocations, including overwrites
    pub async fn call_writes(&self) -> u64 {
        self.store.lock().await.call_writes
    }

    pub async fn history(&self, agent: AgentId) -> Vec<AgentHistoryEntry> {
        self.store
            .lock()
            .await
            .history
            .iter()
            .filter(|e| e.agent == agent)
            .cloned()
            .collect()
    }

    pub async fn agent(&self, agent: AgentId) -> Option<AgentRow> {
        self.store.lock().await.agents.get(&agent).cloned()
    }

    pub async fn queue_stats(&self, queue: QueueId) -> Option<QueueStatsRow> {
        self.store.lock().await.queue_stats.get(&queue).cloned()
    }

    pub async fn member_calls(&self, queue: QueueId, agent: AgentId) -> Option<MemberCalls> {
        self.store
            .lock()
            .await
            .member_calls
            .get(&(queue, agent))
            .copied()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn upsert_call(&self, record: &CallRecord) -> Result<(), SinkError> {
        self.check_available()?;
        let mut store = self.store.lock().await;
        store.call_writes += 1;
        store.calls.insert(record.call_id.clone(), record.clone());
        Ok(())
    }

    async fn append_or_close_agent_history(
        &self,
        entry: &AgentHistoryEntry,
    ) -> Result<(), SinkError> {
        self.check_available()?;
        let mut store = self.store.lock().await;
        if entry.is_open() {
            store.history.push(entry.clone());
            return Ok(());
        }

        let open = store.history.iter_mut().find(|e| {
            e.agent == entry.agent && e.started_at == entry.started_at && e.is_open()
        });
        match open {
            Some(existing) => {
                existing.ended_at = entry.ended_at;
                existing.duration = entry.duration;
            }
            None => {
                debug!(
                    "No open history entry for {} since {}, storing closed entry",
                    entry.agent, entry.started_at
                );
                store.history.push(entry.clone());
            }
        }
        Ok(())
    }

    async fn update_agent(&self, update: &AgentUpdate) -> Result<(), SinkError> {
        self.check_available()?;
        let mut store = self.store.lock().await;
        let row = store.agents.entry(update.agent).or_insert_with(|| AgentRow {
            status: update.status,
            current_calls: 0,
            logged_in_at: None,
            totals: AgentCounters::default(),
        });
        row.status = update.status;
        row.current_calls = update.current_calls;
        row.logged_in_at = update.logged_in_at;
        row.totals.add(&update.deltas);
        Ok(())
    }

    async fn upsert_queue_stats(&self, update: &QueueStatsUpdate) -> Result<(), SinkError> {
        self.check_available()?;
        let mut store = self.store.lock().await;
        store
            .queue_stats
            .entry(update.queue)
            .or_default()
            .apply(update);
        Ok(())
    }

    async fn record_member_call(
        &self,
        queue: QueueId,
        agent: AgentId,
        at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.check_available()?;
        let mut store = self.store.lock().await;
        let member = store
            .member_calls
            .entry((queue, agent))
            .or_insert(MemberCalls {
                calls_taken: 0,
                last_call: at,
            });
        member.calls_taken += 1;
        member.last_call = at;
        Ok(())
    }

    async fn find_agent_by_extension(
        &self,
        extension: &str,
    ) -> Result<Option<AgentId>, SinkError> {
        Ok(self.directory.agent(extension))
    }

    async fn find_queue_by_name(&self, name: &str) -> Result<Option<QueueRef>, SinkError> {
        Ok(self.directory.queue(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{QueueCounters, QueueGauges};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn directory() -> Directory {
        Directory::new()
            .with_agent("1001", AgentId(7))
            .with_queue(QueueRef {
                id: QueueId(3),
                name: "support".to_string(),
                wrapup_time: 0,
                service_level: 20,
            })
    }

    #[tokio::test]
    async fn test_lookups() {
        let sink = MemorySink::new(directory());
        assert_eq!(
            sink.find_agent_by_extension("1001").await.unwrap(),
            Some(AgentId(7))
        );
        assert_eq!(sink.find_agent_by_extension("9999").await.unwrap(), None);
        let queue = sink.find_queue_by_name("support").await.unwrap().unwrap();
        assert_eq!(queue.id, QueueId(3));
        assert!(sink.find_queue_by_name("sales").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_open_then_close() {
        let sink = MemorySink::new(Directory::new());
        let open = AgentHistoryEntry {
            agent: AgentId(1),
            status: AgentStatus::OnCall,
            started_at: at(0),
            ended_at: None,
            duration: 0,
        };
        sink.append_or_close_agent_history(&open).await.unwrap();
        let closed = AgentHistoryEntry {
            ended_at: Some(at(30)),
            duration: 30,
            ..open.clone()
        };
        sink.append_or_close_agent_history(&closed).await.unwrap();

        let history = sink.history(AgentId(1)).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].duration, 30);
        assert!(!history[0].is_open());
    }

    #[tokio::test]
    async fn test_queue_deltas_floor_at_zero() {
        let sink = MemorySink::new(Directory::new());
        let mut update = QueueStatsUpdate::new(QueueId(3));
        update.deltas = QueueCounters {
            calls_waiting: -1,
            calls_abandoned: 1,
            ..Default::default()
        };
        update.gauges = QueueGauges {
            agents_available: Some(2),
            ..Default::default()
        };
        sink.upsert_queue_stats(&update).await.unwrap();

        let row = sink.queue_stats(QueueId(3)).await.unwrap();
        assert_eq!(row.calls_waiting, 0);
        assert_eq!(row.calls_abandoned, 1);
        assert_eq!(row.agents_available, 2);
    }

    #[tokio::test]
    async fn test_failing_sink_rejects_writes() {
        let sink = MemorySink::new(Directory::new());
        sink.set_failing(true);
        let err = sink
            .record_member_call(QueueId(1), AgentId(1), at(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));

        sink.set_failing(false);
        sink.record_member_call(QueueId(1), AgentId(1), at(5))
            .await
            .unwrap();
        sink.record_member_call(QueueId(1), AgentId(1), at(9))
            .await
            .unwrap();
        let member = sink.member_calls(QueueId(1), AgentId(1)).await.unwrap();
        assert_eq!(member.calls_taken, 2);
        assert_eq!(member.last_call, at(9));
    }

    #[test]
    fn test_directory_json() {
        let directory: Directory = serde_json::from_str(
            r#"{"agents": {"1001": 7}, "queues": [{"id": 3, "name": "support", "wrapup_time": 15}]}"#,
        )
        .unwrap();
        assert_eq!(directory.agent("1001"), Some(AgentId(7)));
        let queue = directory.queue("support").unwrap();
        assert_eq!(queue.wrapup_time, 15);
        assert_eq!(queue.service_level, 60);
    }
}
