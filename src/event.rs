//! AMI event types and typed header access

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use indexmap::IndexMap;
use std::fmt;
use tracing::warn;

use crate::{
    constants::*,
    error::{AmiError, AmiResult},
};

/// Event kinds the tracker acts on. Decoded once from the `Event:` header;
/// the match is exact and case-sensitive, as the switch emits it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AmiEventType {
    Cdr,
    QueueCallerJoin,
    QueueCallerAbandon,
    QueueCallerLeave,
    AgentConnect,
    AgentComplete,
    AgentRingNoAnswer,
    Hold,
    Unhold,
    BlindTransfer,
    AttendedTransfer,
    VoicemailUserEntry,
    QueueMemberStatus,
    QueueMemberPause,
    AgentLogin,
    AgentLogoff,
    /// Switch is going down; treated as a transport failure
    Shutdown,
    /// Switch finished booting; informational
    FullyBooted,
    /// Anything else. Dropped by the dispatcher.
    Unrecognized(String),
}

impl AmiEventType {
    pub fn parse_event_type(s: &str) -> Self {
        match s {
            "Cdr" => AmiEventType::Cdr,
            "QueueCallerJoin" => AmiEventType::QueueCallerJoin,
            "QueueCallerAbandon" => AmiEventType::QueueCallerAbandon,
            "QueueCallerLeave" => AmiEventType::QueueCallerLeave,
            "AgentConnect" => AmiEventType::AgentConnect,
            "AgentComplete" => AmiEventType::AgentComplete,
            "AgentRingNoAnswer" => AmiEventType::AgentRingNoAnswer,
            "Hold" => AmiEventType::Hold,
            "Unhold" => AmiEventType::Unhold,
            "BlindTransfer" => AmiEventType::BlindTransfer,
            "AttendedTransfer" => AmiEventType::AttendedTransfer,
            "VoicemailUserEntry" => AmiEventType::VoicemailUserEntry,
            "QueueMemberStatus" => AmiEventType::QueueMemberStatus,
            "QueueMemberPause" => AmiEventType::QueueMemberPause,
            "AgentLogin" => AmiEventType::AgentLogin,
            "AgentLogoff" => AmiEventType::AgentLogoff,
            "Shutdown" => AmiEventType::Shutdown,
            "FullyBooted" => AmiEventType::FullyBooted,
            other => AmiEventType::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AmiEventType::Cdr => "Cdr",
            AmiEventType::QueueCallerJoin => "QueueCallerJoin",
            AmiEventType::QueueCallerAbandon => "QueueCallerAbandon",
            AmiEventType::QueueCallerLeave => "QueueCallerLeave",
            AmiEventType::AgentConnect => "AgentConnect",
            AmiEventType::AgentComplete => "AgentComplete",
            AmiEventType::AgentRingNoAnswer => "AgentRingNoAnswer",
            AmiEventType::Hold => "Hold",
            AmiEventType::Unhold => "Unhold",
            AmiEventType::BlindTransfer => "BlindTransfer",
            AmiEventType::AttendedTransfer => "AttendedTransfer",
            AmiEventType::VoicemailUserEntry => "VoicemailUserEntry",
            AmiEventType::QueueMemberStatus => "QueueMemberStatus",
            AmiEventType::QueueMemberPause => "QueueMemberPause",
            AmiEventType::AgentLogin => "AgentLogin",
            AmiEventType::AgentLogoff => "AgentLogoff",
            AmiEventType::Shutdown => "Shutdown",
            AmiEventType::FullyBooted => "FullyBooted",
            AmiEventType::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for AmiEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event frame with its headers. Repeated keys keep the last value.
#[derive(Debug, Clone)]
pub struct AmiEvent {
    event_type: AmiEventType,
    headers: IndexMap<String, String>,
    received_at: DateTime<Utc>,
}

impl AmiEvent {
    /// Build an event from parsed headers, stamping the receipt time
    pub fn from_headers(headers: IndexMap<String, String>) -> Self {
        let event_type = headers
            .get(HEADER_EVENT)
            .map(|name| AmiEventType::parse_event_type(name))
            .unwrap_or_else(|| AmiEventType::Unrecognized(String::new()));
        Self {
            event_type,
            headers,
            received_at: Utc::now(),
        }
    }

    /// Create event with specified type and no other headers
    pub fn with_type(event_type: AmiEventType) -> Self {
        let mut headers = IndexMap::new();
        headers.insert(HEADER_EVENT.to_string(), event_type.to_string());
        Self {
            event_type,
            headers,
            received_at: Utc::now(),
        }
    }

    /// Builder-style header setter, mostly for tests and replays
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn event_type(&self) -> &AmiEventType {
        &self.event_type
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Get header value by exact name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// First non-empty value among `names`
    pub fn first_header(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.header(name))
            .find(|value| !value.is_empty())
    }

    /// Header that the handler cannot do without
    pub fn require(&self, name: &str) -> AmiResult<&str> {
        self.header(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AmiError::missing_header(self.event_type.as_str(), name))
    }

    /// Switch-assigned call identifier
    pub fn call_id(&self) -> Option<&str> {
        self.first_header(CALL_ID_HEADERS)
    }

    pub fn require_call_id(&self) -> AmiResult<&str> {
        self.call_id()
            .ok_or_else(|| AmiError::missing_header(self.event_type.as_str(), "Uniqueid"))
    }

    /// Integer header. Missing or empty yields `default`; a garbled value
    /// is logged and also yields `default`.
    pub fn optional_int(&self, name: &str, default: i64) -> i64 {
        match self.header(name).map(str::trim) {
            None | Some("") => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(
                    "{} event has non-numeric {}: {:?}, using {}",
                    self.event_type, name, raw, default
                );
                default
            }),
        }
    }

    /// Boolean header (`1`, `true`, `yes`, `on`)
    pub fn flag(&self, name: &str) -> bool {
        self.header(name)
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false)
    }

    /// When the switch generated the event (`Timestamp: 1700000000.123456`,
    /// present with `timestampevents=yes`), else when we received it.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.header(HEADER_TIMESTAMP)
            .and_then(parse_epoch)
            .unwrap_or(self.received_at)
    }

    /// CDR-style datetime header. The switch writes these in its own local
    /// time, so `offset` is the switch's UTC offset.
    pub fn datetime(&self, name: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
        self.header(name).and_then(|raw| parse_cdr_datetime(raw, offset))
    }
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match raw.trim().split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (raw.trim(), ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain("000000".chars()).take(6).collect();
        digits.parse().ok()?
    };
    Utc.timestamp_opt(secs, micros * 1000).single()
}

/// Parse `2024-01-15 10:30:00` or `2024-01-15T10:30:00` as local time at
/// `offset`. Empty means "never".
pub fn parse_cdr_datetime(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|local| local.with_timezone(&Utc))
}

/// Extension number from a channel or interface token.
///
/// `PJSIP/1001-0000002a` → `1001`, `SIP/1001` → `1001`,
/// `Local/1001@from-queue-00000001;1` → `1001`.
pub fn extract_extension(channel: &str) -> Option<&str> {
    let (_, rest) = channel.split_once('/')?;
    let end = rest
        .find(|c| matches!(c, '-' | '@' | ';'))
        .unwrap_or(rest.len());
    let ext = &rest[..end];
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}
