//! Agent presence state machine.
//!
//! Every status change closes the agent's open history interval, folds its
//! length into the accumulator for the status being left, and opens a new
//! interval. An agent therefore never has more than one open interval.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::records::{AgentCounters, AgentHistoryEntry, AgentId, AgentUpdate, QueueId, QueueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Available,
    Busy,
    #[serde(rename = "oncall")]
    OnCall,
    Break,
    #[serde(rename = "wrapup")]
    WrapUp,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::OnCall => "oncall",
            AgentStatus::Break => "break",
            AgentStatus::WrapUp => "wrapup",
            AgentStatus::Offline => "offline",
        }
    }

    /// Map a queue member device status code.
    ///
    /// Ringing (6), ring-in-use (7) and on-hold (8) are folded into on-call;
    /// unknown (0) and anything unlisted yield `None` and are ignored.
    pub fn from_member_status(code: i64) -> Option<Self> {
        match code {
            1 => Some(AgentStatus::Available),
            2 | 6 | 7 | 8 => Some(AgentStatus::OnCall),
            3 => Some(AgentStatus::Busy),
            4 | 5 => Some(AgentStatus::Offline),
            _ => None,
        }
    }

    /// Counts toward a queue's `agents_busy`
    pub fn is_engaged(&self) -> bool {
        matches!(
            self,
            AgentStatus::OnCall | AgentStatus::Busy | AgentStatus::WrapUp
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory view of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub agent: AgentId,
    pub status: AgentStatus,
    pub current_calls: u32,
    pub logged_in_at: Option<DateTime<Utc>>,
    /// Start of the open history interval
    pub status_since: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub wrapup_until: Option<DateTime<Utc>>,
    /// Accumulators since this process started
    pub totals: AgentCounters,
    pub calls_taken: HashMap<QueueId, u64>,
}

impl AgentState {
    fn new(agent: AgentId) -> Self {
        Self {
            agent,
            status: AgentStatus::Offline,
            current_calls: 0,
            logged_in_at: None,
            status_since: None,
            pause_reason: None,
            wrapup_until: None,
            totals: AgentCounters::default(),
            calls_taken: HashMap::new(),
        }
    }

    fn update(&self, deltas: AgentCounters) -> AgentUpdate {
        AgentUpdate {
            agent: self.agent,
            status: self.status,
            current_calls: self.current_calls,
            logged_in_at: self.logged_in_at,
            deltas,
        }
    }
}

/// Durable effects of one presence mutation
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceChange {
    /// Close of the previous interval (if any), then open of the new one
    pub history: Vec<AgentHistoryEntry>,
    pub update: AgentUpdate,
}

impl PresenceChange {
    pub fn status_changed(&self) -> bool {
        !self.history.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PresenceEngine {
    agents: HashMap<AgentId, AgentState>,
}

impl PresenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(&self, agent: AgentId) -> Option<&AgentState> {
        self.agents.get(&agent)
    }

    fn state_mut(&mut self, agent: AgentId) -> &mut AgentState {
        self.agents
            .entry(agent)
            .or_insert_with(|| AgentState::new(agent))
    }

    /// Move `agent` to `status` at `at`. `None` if it already has that status.
    pub fn transition(
        &mut self,
        agent: AgentId,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Option<PresenceChange> {
        let state = self.state_mut(agent);
        if state.status == status {
            return None;
        }
        Some(apply_transition(state, status, at))
    }

    pub fn login(&mut self, agent: AgentId, at: DateTime<Utc>) -> PresenceChange {
        let state = self.state_mut(agent);
        state.logged_in_at = Some(at);
        if state.status == AgentStatus::Available {
            return PresenceChange {
                history: Vec::new(),
                update: state.update(AgentCounters::default()),
            };
        }
        apply_transition(state, AgentStatus::Available, at)
    }

    pub fn logoff(&mut self, agent: AgentId, at: DateTime<Utc>) -> PresenceChange {
        let state = self.state_mut(agent);
        state.logged_in_at = None;
        state.current_calls = 0;
        if state.status == AgentStatus::Offline {
            return PresenceChange {
                history: Vec::new(),
                update: state.update(AgentCounters::default()),
            };
        }
        apply_transition(state, AgentStatus::Offline, at)
    }

    /// Paused agents go on break; unpausing returns a break to available.
    ///
    /// A member status that leaves the break, such as an unpaused available
    /// or an in-use code, goes through [`Self::transition`] instead, and any
    /// move out of `Break` clears `pause_reason` there.
    pub fn set_paused(
        &mut self,
        agent: AgentId,
        paused: bool,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<PresenceChange> {
        let state = self.state_mut(agent);
        if paused {
            if state.status == AgentStatus::Break {
                state.pause_reason = reason.map(str::to_string);
                return None;
            }
            let change = apply_transition(state, AgentStatus::Break, at);
            state.pause_reason = reason.map(str::to_string);
            Some(change)
        } else if state.status == AgentStatus::Break {
            Some(apply_transition(state, AgentStatus::Available, at))
        } else {
            None
        }
    }

    /// Agent picked up a call
    pub fn call_connected(&mut self, agent: AgentId, at: DateTime<Utc>) -> PresenceChange {
        let state = self.state_mut(agent);
        state.current_calls += 1;
        if state.status == AgentStatus::OnCall {
            return PresenceChange {
                history: Vec::new(),
                update: state.update(AgentCounters::default()),
            };
        }
        apply_transition(state, AgentStatus::OnCall, at)
    }

    /// Agent finished a call. Goes to wrap-up when the queue asks for it,
    /// otherwise back to available once no calls remain.
    pub fn call_completed(
        &mut self,
        agent: AgentId,
        queue: Option<&QueueRef>,
        at: DateTime<Utc>,
    ) -> PresenceChange {
        let state = self.state_mut(agent);
        state.current_calls = state.current_calls.saturating_sub(1);
        if let Some(queue) = queue {
            *state.calls_taken.entry(queue.id).or_insert(0) += 1;
        }

        let wrapup = queue.map(|q| q.wrapup_time).unwrap_or(0);
        let next = if state.current_calls > 0 {
            None
        } else if wrapup > 0 {
            Some(AgentStatus::WrapUp)
        } else {
            Some(AgentStatus::Available)
        };

        match next {
            Some(status) if status != state.status => {
                let change = apply_transition(state, status, at);
                if status == AgentStatus::WrapUp {
                    state.wrapup_until = Some(at + Duration::seconds(i64::from(wrapup)));
                }
                change
            }
            _ => PresenceChange {
                history: Vec::new(),
                update: state.update(AgentCounters::default()),
            },
        }
    }

    /// Count a finished call toward the agent's daily totals
    pub fn record_call(&mut self, agent: AgentId, talk_secs: u64) -> AgentUpdate {
        let deltas = AgentCounters {
            calls: 1,
            talk_time: talk_secs,
            ..Default::default()
        };
        let state = self.state_mut(agent);
        state.totals.add(&deltas);
        state.update(deltas)
    }

    /// Return agents whose wrap-up window has passed to available
    pub fn expire_wrapups(&mut self, now: DateTime<Utc>) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        for state in self.agents.values_mut() {
            if state.status != AgentStatus::WrapUp {
                continue;
            }
            match state.wrapup_until {
                Some(until) if until <= now => {
                    debug!("[PRESENCE] {} wrap-up ended", state.agent);
                    changes.push(apply_transition(state, AgentStatus::Available, until));
                }
                _ => {}
            }
        }
        changes
    }
}

fn apply_transition(
    state: &mut AgentState,
    status: AgentStatus,
    at: DateTime<Utc>,
) -> PresenceChange {
    let mut history = Vec::with_capacity(2);
    let mut deltas = AgentCounters::default();

    if let Some(since) = state.status_since.take() {
        let duration = (at - since).num_seconds().max(0) as u64;
        match state.status {
            AgentStatus::Available => deltas.available_time = duration,
            AgentStatus::Break => deltas.break_time = duration,
            AgentStatus::OnCall => deltas.oncall_time = duration,
            AgentStatus::WrapUp => deltas.wrapup_time = duration,
            AgentStatus::Busy | AgentStatus::Offline => {}
        }
        history.push(AgentHistoryEntry {
            agent: state.agent,
            status: state.status,
            started_at: since,
            ended_at: Some(at),
            duration,
        });
    }

    debug!(
        "[PRESENCE] {} {} -> {}",
        state.agent, state.status, status
    );
    state.status = status;
    state.status_since = Some(at);
    state.totals.add(&deltas);
    if status != AgentStatus::WrapUp {
        state.wrapup_until = None;
    }
    if status != AgentStatus::Break {
        state.pause_reason = None;
    }
    history.push(AgentHistoryEntry {
        agent: state.agent,
        status,
        started_at: at,
        ended_at: None,
        duration: 0,
    });

    PresenceChange {
        history,
        update: state.update(deltas),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn queue(wrapup: u32) -> QueueRef {
        QueueRef {
            id: QueueId(1),
            name: "support".to_string(),
            wrapup_time: wrapup,
            service_level: 20,
        }
    }

    const A: AgentId = AgentId(9);

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(AgentStatus::from_member_status(1), Some(AgentStatus::Available));
        assert_eq!(AgentStatus::from_member_status(2), Some(AgentStatus::OnCall));
        assert_eq!(AgentStatus::from_member_status(3), Some(AgentStatus::Busy));
        assert_eq!(AgentStatus::from_member_status(4), Some(AgentStatus::Offline));
        assert_eq!(AgentStatus::from_member_status(5), Some(AgentStatus::Offline));
        assert_eq!(AgentStatus::from_member_status(6), Some(AgentStatus::OnCall));
        assert_eq!(AgentStatus::from_member_status(8), Some(AgentStatus::OnCall));
        assert_eq!(AgentStatus::from_member_status(0), None);
        assert_eq!(AgentStatus::from_member_status(42), None);
    }

    #[test]
    fn test_transition_closes_previous_interval() {
        let mut engine = PresenceEngine::new();
        let first = engine.transition(A, AgentStatus::Available, at(0)).unwrap();
        assert_eq!(first.history.len(), 1);
        assert!(first.history[0].is_open());

        let second = engine.transition(A, AgentStatus::OnCall, at(30)).unwrap();
        assert_eq!(second.history.len(), 2);
        let closed = &second.history[0];
        assert_eq!(closed.status, AgentStatus::Available);
        assert_eq!(closed.ended_at, Some(at(30)));
        assert_eq!(closed.duration, 30);
        assert_eq!(second.update.deltas.available_time, 30);
        assert!(second.history[1].is_open());
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut engine = PresenceEngine::new();
        engine.transition(A, AgentStatus::OnCall, at(0));
        assert!(engine.transition(A, AgentStatus::OnCall, at(5)).is_none());
        assert_eq!(engine.agent(A).unwrap().status_since, Some(at(0)));
    }

    #[test]
    fn test_call_complete_with_wrapup() {
        let mut engine = PresenceEngine::new();
        engine.login(A, at(0));
        engine.call_connected(A, at(10));
        let change = engine.call_completed(A, Some(&queue(15)), at(40));
        assert_eq!(change.update.status, AgentStatus::WrapUp);
        assert_eq!(change.update.deltas.oncall_time, 30);
        assert_eq!(change.update.current_calls, 0);

        assert!(engine.expire_wrapups(at(50)).is_empty());
        let expired = engine.expire_wrapups(at(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].update.status, AgentStatus::Available);
        assert_eq!(expired[0].update.deltas.wrapup_time, 15);
        assert_eq!(engine.agent(A).unwrap().calls_taken.get(&QueueId(1)), Some(&1));
    }

    #[test]
    fn test_call_complete_without_wrapup() {
        let mut engine = PresenceEngine::new();
        engine.call_connected(A, at(0));
        engine.call_connected(A, at(5));
        let change = engine.call_completed(A, Some(&queue(0)), at(20));
        assert_eq!(change.update.status, AgentStatus::OnCall);
        assert!(!change.status_changed());
        let change = engine.call_completed(A, Some(&queue(0)), at(25));
        assert_eq!(change.update.status, AgentStatus::Available);
        assert_eq!(change.update.deltas.oncall_time, 25);
    }

    #[test]
    fn test_pause_and_unpause() {
        let mut engine = PresenceEngine::new();
        engine.login(A, at(0));
        let change = engine.set_paused(A, true, Some("lunch"), at(100)).unwrap();
        assert_eq!(change.update.status, AgentStatus::Break);
        assert_eq!(engine.agent(A).unwrap().pause_reason.as_deref(), Some("lunch"));

        let change = engine.set_paused(A, false, None, at(160)).unwrap();
        assert_eq!(change.update.deltas.break_time, 60);
        assert_eq!(engine.agent(A).unwrap().pause_reason, None);
        assert!(engine.set_paused(A, false, None, at(170)).is_none());
    }

    #[test]
    fn test_status_change_clears_pause_reason() {
        let mut engine = PresenceEngine::new();
        engine.login(A, at(0));
        engine.set_paused(A, true, Some("training"), at(10));

        let change = engine.transition(A, AgentStatus::OnCall, at(40)).unwrap();
        assert_eq!(change.update.deltas.break_time, 30);
        assert_eq!(engine.agent(A).unwrap().pause_reason, None);
        assert!(engine.set_paused(A, false, None, at(50)).is_none());
    }

    #[test]
    fn test_logoff_clears_session() {
        let mut engine = PresenceEngine::new();
        engine.login(A, at(0));
        engine.call_connected(A, at(10));
        let change = engine.logoff(A, at(20));
        assert_eq!(change.update.status, AgentStatus::Offline);
        assert_eq!(change.update.current_calls, 0);
        assert_eq!(change.update.logged_in_at, None);
        assert_eq!(change.update.deltas.oncall_time, 10);
    }

    #[test]
    fn test_out_of_order_time_floors_at_zero() {
        let mut engine = PresenceEngine::new();
        engine.transition(A, AgentStatus::Available, at(50));
        let change = engine.transition(A, AgentStatus::Break, at(40)).unwrap();
        assert_eq!(change.history[0].duration, 0);
    }

    #[test]
    fn test_record_call_counts() {
        let mut engine = PresenceEngine::new();
        let update = engine.record_call(A, 42);
        assert_eq!(update.deltas.calls, 1);
        assert_eq!(update.deltas.talk_time, 42);
        assert_eq!(engine.agent(A).unwrap().totals.calls, 1);
    }
}
