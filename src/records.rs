//! Durable record shapes handed to the [`RecordSink`](crate::sink::RecordSink)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::presence::AgentStatus;

/// Agent primary key in the persistence layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub i64);

/// Queue primary key in the persistence layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub i64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

/// Queue as known to the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRef {
    pub id: QueueId,
    pub name: String,
    /// Post-call wrap-up in seconds; 0 means agents go straight back to available
    #[serde(default)]
    pub wrapup_time: u32,
    /// Service-level threshold in seconds
    #[serde(default = "default_service_level")]
    pub service_level: u32,
}

fn default_service_level() -> u32 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

/// Final status of a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Completed,
    NoAnswer,
    Busy,
    Failed,
    Abandoned,
    Voicemail,
    Transferred,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Completed => "completed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::Abandoned => "abandoned",
            CallStatus::Voicemail => "voicemail",
            CallStatus::Transferred => "transferred",
        }
    }

    /// Map the switch's CDR disposition. Unknown dispositions count as completed.
    pub fn from_disposition(disposition: &str) -> Self {
        match disposition.trim().to_ascii_uppercase().as_str() {
            "ANSWERED" => CallStatus::Completed,
            "NO ANSWER" => CallStatus::NoAnswer,
            "BUSY" => CallStatus::Busy,
            "FAILED" | "CONGESTION" => CallStatus::Failed,
            _ => CallStatus::Completed,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recording file found for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRef {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub format: String,
}

/// Finalized call. Keyed by `call_id`; writing it twice must overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub unique_id: String,
    pub channel: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub caller_id: String,
    pub called_number: String,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    /// Seconds
    pub wait_time: u64,
    pub talk_time: u64,
    pub hold_time: u64,
    pub agent: Option<AgentId>,
    pub queue: Option<QueueId>,
    pub recording: Option<RecordingRef>,
    pub transferred: bool,
    pub transfer_target: Option<String>,
    pub metadata: serde_json::Value,
}

impl CallRecord {
    pub fn is_recorded(&self) -> bool {
        self.recording.is_some()
    }

    pub fn duration(&self) -> u64 {
        (self.end_time - self.start_time).num_seconds().max(0) as u64
    }
}

/// One status interval. `ended_at == None` opens the interval; a second
/// write with the same agent and `started_at` closes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHistoryEntry {
    pub agent: AgentId,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds; 0 while open
    pub duration: u64,
}

impl AgentHistoryEntry {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Same-day accumulators, in seconds except `calls`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounters {
    pub available_time: u64,
    pub break_time: u64,
    pub oncall_time: u64,
    pub wrapup_time: u64,
    pub calls: u64,
    pub talk_time: u64,
}

impl AgentCounters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn add(&mut self, other: &AgentCounters) {
        self.available_time += other.available_time;
        self.break_time += other.break_time;
        self.oncall_time += other.oncall_time;
        self.wrapup_time += other.wrapup_time;
        self.calls += other.calls;
        self.talk_time += other.talk_time;
    }
}

/// Agent row change: current values plus accumulator increments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub agent: AgentId,
    pub status: AgentStatus,
    pub current_calls: u32,
    pub logged_in_at: Option<DateTime<Utc>>,
    pub deltas: AgentCounters,
}

/// Relative counter changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub calls_waiting: i64,
    pub calls_completed: i64,
    pub calls_abandoned: i64,
    pub service_level_met: i64,
}

impl QueueCounters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Point-in-time values; `None` leaves the stored value alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueGauges {
    pub avg_wait_time: Option<u64>,
    pub avg_talk_time: Option<u64>,
    pub max_wait_time: Option<u64>,
    pub agents_available: Option<u32>,
    pub agents_busy: Option<u32>,
    pub service_level_percentage: Option<f64>,
}

impl QueueGauges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatsUpdate {
    pub queue: QueueId,
    pub deltas: QueueCounters,
    pub gauges: QueueGauges,
}

impl QueueStatsUpdate {
    pub fn new(queue: QueueId) -> Self {
        Self {
            queue,
            deltas: QueueCounters::default(),
            gauges: QueueGauges::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.gauges.is_empty()
    }
}
