//! Route events to handlers and flush their effects to the sink.
//!
//! Each event is handled in three steps: resolve agent and queue references
//! through the sink, mutate in-memory state under a single lock, then write
//! the resulting records after the lock is released. State mutation for one
//! event is therefore atomic with respect to other events and to the sweep.

use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::{
    config::TrackerConfig,
    correlation::{CorrelationState, CorrelationStore, SweepStats},
    error::{AmiError, AmiResult},
    event::{extract_extension, AmiEvent, AmiEventType},
    handlers,
    presence::{AgentState, PresenceChange, PresenceEngine},
    queue_stats::{QueueStats, QueueStatsAggregator},
    recording::RecordingLocator,
    records::{AgentHistoryEntry, AgentId, AgentUpdate, CallRecord, QueueId, QueueRef, QueueStatsUpdate},
    sink::RecordSink,
};

/// One durable effect produced while state was locked
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkWrite {
    Call(Box<CallRecord>),
    History(AgentHistoryEntry),
    Agent(AgentUpdate),
    Queue(QueueStatsUpdate),
    MemberCall {
        queue: QueueId,
        agent: AgentId,
        at: DateTime<Utc>,
    },
}

/// Everything the handlers mutate, guarded together
pub(crate) struct TrackerState {
    pub calls: CorrelationStore,
    pub agents: PresenceEngine,
    pub queues: QueueStatsAggregator,
}

impl TrackerState {
    /// Writes for a presence change, plus the gauge updates it causes in the
    /// agent's queues
    pub fn presence_writes(&mut self, change: PresenceChange, writes: &mut Vec<SinkWrite>) {
        if change.status_changed() {
            for update in self
                .queues
                .agent_status_changed(change.update.agent, change.update.status)
            {
                writes.push(SinkWrite::Queue(update));
            }
        }
        writes.extend(change.history.into_iter().map(SinkWrite::History));
        writes.push(SinkWrite::Agent(change.update));
    }
}

pub struct EventDispatcher {
    pub(crate) state: Mutex<TrackerState>,
    pub(crate) sink: Arc<dyn RecordSink>,
    pub(crate) recordings: RecordingLocator,
    /// Switch clock offset for CDR datetime fields
    pub(crate) cdr_offset: FixedOffset,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn RecordSink>, config: &TrackerConfig) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                calls: CorrelationStore::new(config.correlation_ttl),
                agents: PresenceEngine::new(),
                queues: QueueStatsAggregator::new(),
            }),
            sink,
            recordings: RecordingLocator::new(
                config.recording_dirs.clone(),
                config.min_recording_size,
            ),
            cdr_offset: config.cdr_utc_offset,
        }
    }

    /// Handle one event. Errors affect only this event; the caller logs them
    /// and keeps reading.
    pub async fn dispatch(&self, event: &AmiEvent) -> AmiResult<()> {
        trace!("[DISPATCH] {}", event.event_type());
        let writes = match event.event_type() {
            AmiEventType::Cdr => handlers::cdr::handle_cdr(self, event).await?,
            AmiEventType::QueueCallerJoin => handlers::queue::handle_join(self, event).await?,
            AmiEventType::QueueCallerAbandon => {
                handlers::queue::handle_abandon(self, event).await?
            }
            AmiEventType::QueueCallerLeave => handlers::queue::handle_leave(self, event).await?,
            AmiEventType::AgentConnect => {
                handlers::queue::handle_agent_connect(self, event).await?
            }
            AmiEventType::AgentComplete => {
                handlers::queue::handle_agent_complete(self, event).await?
            }
            AmiEventType::AgentRingNoAnswer => {
                handlers::queue::handle_ring_no_answer(self, event).await?
            }
            AmiEventType::Hold => handlers::channel::handle_hold(self, event).await?,
            AmiEventType::Unhold => handlers::channel::handle_unhold(self, event).await?,
            AmiEventType::BlindTransfer | AmiEventType::AttendedTransfer => {
                handlers::channel::handle_transfer(self, event).await?
            }
            AmiEventType::VoicemailUserEntry => {
                handlers::channel::handle_voicemail(self, event).await?
            }
            AmiEventType::QueueMemberStatus => {
                handlers::agent::handle_member_status(self, event).await?
            }
            AmiEventType::QueueMemberPause => handlers::agent::handle_pause(self, event).await?,
            AmiEventType::AgentLogin => handlers::agent::handle_login(self, event).await?,
            AmiEventType::AgentLogoff => handlers::agent::handle_logoff(self, event).await?,
            AmiEventType::FullyBooted => {
                info!("Asterisk reports fully booted");
                Vec::new()
            }
            AmiEventType::Shutdown | AmiEventType::Unrecognized(_) => {
                trace!("[DISPATCH] Dropping {}", event.event_type());
                Vec::new()
            }
        };
        self.flush(writes).await
    }

    /// Send writes in order. A failed write is logged and the rest still go
    /// out; the first failure is returned.
    pub(crate) async fn flush(&self, writes: Vec<SinkWrite>) -> AmiResult<()> {
        let mut first_error: Option<AmiError> = None;
        for write in writes {
            let result = match &write {
                SinkWrite::Call(record) => self.sink.upsert_call(record).await,
                SinkWrite::History(entry) => self.sink.append_or_close_agent_history(entry).await,
                SinkWrite::Agent(update) => self.sink.update_agent(update).await,
                SinkWrite::Queue(update) => self.sink.upsert_queue_stats(update).await,
                SinkWrite::MemberCall { queue, agent, at } => {
                    self.sink.record_member_call(*queue, *agent, *at).await
                }
            };
            if let Err(e) = result {
                error!("[SINK] Write failed: {} ({:?})", e, write);
                if first_error.is_none() {
                    first_error = Some(AmiError::Sink(e));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Agent behind the first channel-like header present. Bare extensions
    /// (no `/`) are looked up as-is.
    pub(crate) async fn resolve_agent(
        &self,
        event: &AmiEvent,
        headers: &[&str],
    ) -> AmiResult<Option<AgentId>> {
        let raw = match event.first_header(headers) {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let extension = if raw.contains('/') {
            match extract_extension(raw) {
                Some(ext) => ext,
                None => {
                    debug!("[RESOLVE] No extension in {:?}", raw);
                    return Ok(None);
                }
            }
        } else {
            raw
        };
        let agent = self.sink.find_agent_by_extension(extension).await?;
        if agent.is_none() {
            debug!("[RESOLVE] No agent for extension {}", extension);
        }
        Ok(agent)
    }

    pub(crate) async fn resolve_queue(&self, event: &AmiEvent) -> AmiResult<Option<QueueRef>> {
        let name = match event.header("Queue").filter(|q| !q.is_empty()) {
            Some(name) => name,
            None => return Ok(None),
        };
        let queue = self.sink.find_queue_by_name(name).await?;
        if queue.is_none() {
            debug!("[RESOLVE] Unknown queue {}", name);
        }
        Ok(queue)
    }

    /// Evict correlation state past its TTL
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let stats = self.state.lock().await.calls.sweep(now);
        if stats.evicted_active > 0 || stats.evicted_finalized > 0 {
            info!(
                "[SWEEP] Evicted {} open and {} finalized calls",
                stats.evicted_active, stats.evicted_finalized
            );
        }
        stats
    }

    /// Move agents whose wrap-up has elapsed back to available
    pub async fn expire_wrapups(&self, now: DateTime<Utc>) -> AmiResult<()> {
        let writes = {
            let mut state = self.state.lock().await;
            let changes = state.agents.expire_wrapups(now);
            let mut writes = Vec::new();
            for change in changes {
                state.presence_writes(change, &mut writes);
            }
            writes
        };
        self.flush(writes).await
    }

    pub async fn agent_state(&self, agent: AgentId) -> Option<AgentState> {
        self.state.lock().await.agents.agent(agent).cloned()
    }

    pub async fn queue_stats(&self, queue: QueueId) -> Option<QueueStats> {
        self.state.lock().await.queues.stats(queue).cloned()
    }

    /// Number of calls with events but no CDR yet
    pub async fn open_calls(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    pub async fn call_state(&self, call_id: &str) -> Option<CorrelationState> {
        self.state.lock().await.calls.get(call_id).cloned()
    }
}
