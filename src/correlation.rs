//! Per-call correlation state.
//!
//! Events for one call arrive as a loose sequence (queue join, agent
//! connect, holds, transfers) and only the final CDR produces a durable
//! record. [`CorrelationStore`] keeps what the intermediate events taught us,
//! keyed by the switch's unique id, until the CDR pops it. Entries that never
//! see a CDR are evicted by [`CorrelationStore::sweep`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::records::{AgentId, QueueId};

/// Terminal outcome learned before the CDR. Overrides the CDR disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Abandoned,
    Voicemail,
    Transferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationState {
    pub call_id: String,
    pub last_touched: DateTime<Utc>,
    pub queue: Option<QueueId>,
    pub queue_name: Option<String>,
    pub queue_enter_time: Option<DateTime<Utc>>,
    /// Counted in the queue's `calls_waiting`, not yet taken back out
    pub waiting: bool,
    pub agent: Option<AgentId>,
    /// When an agent picked the call up
    pub connected_at: Option<DateTime<Utc>>,
    pub agent_completed: bool,
    #[serde(skip)]
    pub hold_accumulated: Duration,
    pub hold_started_at: Option<DateTime<Utc>>,
    pub hold_count: u32,
    pub ring_no_answer_count: u32,
    pub transferred: bool,
    pub transfer_target: Option<String>,
    pub final_status: Option<FinalStatus>,
    pub mailbox: Option<String>,
}

impl CorrelationState {
    pub(crate) fn new(call_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            call_id: call_id.to_string(),
            last_touched: now,
            queue: None,
            queue_name: None,
            queue_enter_time: None,
            waiting: false,
            agent: None,
            connected_at: None,
            agent_completed: false,
            hold_accumulated: Duration::zero(),
            hold_started_at: None,
            hold_count: 0,
            ring_no_answer_count: 0,
            transferred: false,
            transfer_target: None,
            final_status: None,
            mailbox: None,
        }
    }

    /// Record a terminal outcome. The first one wins; returns `false` if one
    /// was already set.
    pub fn set_final_status(&mut self, status: FinalStatus) -> bool {
        match self.final_status {
            Some(existing) => {
                if existing != status {
                    debug!(
                        "Call {} already {:?}, ignoring {:?}",
                        self.call_id, existing, status
                    );
                }
                false
            }
            None => {
                self.final_status = Some(status);
                true
            }
        }
    }

    /// Take the call out of `calls_waiting`. `true` only the first time.
    pub fn leave_queue(&mut self) -> bool {
        std::mem::replace(&mut self.waiting, false)
    }

    /// Open a hold interval. `false` if one is already open.
    pub fn start_hold(&mut self, at: DateTime<Utc>) -> bool {
        if self.hold_started_at.is_some() {
            return false;
        }
        self.hold_started_at = Some(at);
        self.hold_count += 1;
        true
    }

    /// Close the open hold interval. `false` if none was open.
    pub fn end_hold(&mut self, at: DateTime<Utc>) -> bool {
        match self.hold_started_at.take() {
            Some(start) => {
                self.hold_accumulated = self.hold_accumulated + (at - start).max(Duration::zero());
                true
            }
            None => false,
        }
    }

    /// Total hold in whole seconds, counting a still-open hold up to `end`
    pub fn hold_seconds(&self, end: DateTime<Utc>) -> u64 {
        let open = self
            .hold_started_at
            .map(|start| (end - start).max(Duration::zero()))
            .unwrap_or_else(Duration::zero);
        (self.hold_accumulated + open).num_seconds().max(0) as u64
    }

    /// Mark the call transferred. Only the first transfer is kept.
    pub fn mark_transferred(&mut self, target: Option<&str>) -> bool {
        if self.transferred {
            return false;
        }
        self.transferred = true;
        self.transfer_target = target.map(str::to_string);
        self.set_final_status(FinalStatus::Transferred);
        true
    }
}

/// Result of popping a call's state for its CDR
#[derive(Debug, Clone)]
pub enum Finalization {
    /// First CDR for this call
    First(CorrelationState),
    /// CDR seen before; the state is what the first CDR consumed
    Redelivery(CorrelationState),
    /// First CDR, no events were seen for this call
    Untracked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted_active: usize,
    pub evicted_finalized: usize,
}

pub struct CorrelationStore {
    ttl: Duration,
    active: HashMap<String, CorrelationState>,
    /// States already consumed by a CDR, kept so a redelivered CDR can be
    /// rebuilt identically. Aged out by the same TTL.
    finalized: HashMap<String, CorrelationState>,
}

impl CorrelationStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(2)),
            active: HashMap::new(),
            finalized: HashMap::new(),
        }
    }

    pub fn get(&self, call_id: &str) -> Option<&CorrelationState> {
        self.active.get(call_id)
    }

    /// Get or create the state for an event that starts a call leg (queue
    /// join, agent connect) and refresh its TTL.
    ///
    /// A state already past its TTL is discarded and replaced with a fresh
    /// one, and a finalized call id seeing a new leg is treated as reused.
    pub fn open(&mut self, call_id: &str, now: DateTime<Utc>) -> &mut CorrelationState {
        if self.finalized.remove(call_id).is_some() {
            debug!("[CORRELATE] Call id {} reused after its CDR", call_id);
        }
        self.entry(call_id, now)
    }

    /// Get or create the state for any other event on `call_id`.
    ///
    /// `None` once the call's CDR has been seen: late frames (a leave or
    /// unhold trailing the CDR) must not change what a redelivered CDR
    /// rebuilds.
    pub fn touch(&mut self, call_id: &str, now: DateTime<Utc>) -> Option<&mut CorrelationState> {
        if self.finalized.contains_key(call_id) {
            debug!("[CORRELATE] Ignoring late event for finalized {}", call_id);
            return None;
        }
        Some(self.entry(call_id, now))
    }

    pub fn is_finalized(&self, call_id: &str) -> bool {
        self.finalized.contains_key(call_id)
    }

    /// State a CDR already consumed, for events that only flag it
    pub fn finalized_mut(&mut self, call_id: &str) -> Option<&mut CorrelationState> {
        self.finalized.get_mut(call_id)
    }

    fn entry(&mut self, call_id: &str, now: DateTime<Utc>) -> &mut CorrelationState {
        let stale = self
            .active
            .get(call_id)
            .map(|state| now - state.last_touched > self.ttl)
            .unwrap_or(false);
        if stale {
            debug!("[CORRELATE] Discarding stale state for {}", call_id);
            self.active.remove(call_id);
        }

        let state = self
            .active
            .entry(call_id.to_string())
            .or_insert_with(|| CorrelationState::new(call_id, now));
        if now > state.last_touched {
            state.last_touched = now;
        }
        state
    }

    /// Pop the state for a CDR. Each call's state is consumed at most once;
    /// untracked calls are remembered too so their redelivery is recognized.
    pub fn finalize(&mut self, call_id: &str, now: DateTime<Utc>) -> Finalization {
        if let Some(mut state) = self.active.remove(call_id) {
            state.last_touched = now;
            self.finalized.insert(call_id.to_string(), state.clone());
            return Finalization::First(state);
        }
        if let Some(state) = self.finalized.get(call_id) {
            return Finalization::Redelivery(state.clone());
        }
        self.finalized
            .insert(call_id.to_string(), CorrelationState::new(call_id, now));
        Finalization::Untracked
    }

    /// Evict everything untouched for longer than the TTL
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepStats {
        let ttl = self.ttl;
        let before_active = self.active.len();
        let before_finalized = self.finalized.len();
        self.active.retain(|_, state| now - state.last_touched <= ttl);
        self.finalized
            .retain(|_, state| now - state.last_touched <= ttl);
        SweepStats {
            evicted_active: before_active - self.active.len(),
            evicted_finalized: before_finalized - self.finalized.len(),
        }
    }

    /// Calls with events but no CDR yet
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn finalized_len(&self) -> usize {
        self.finalized.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> CorrelationStore {
        CorrelationStore::new(std::time::Duration::from_secs(7200))
    }

    #[test]
    fn test_touch_creates_once() {
        let mut store = store();
        store.open("1.1", at(0)).queue_name = Some("support".to_string());
        let state = store.touch("1.1", at(5)).unwrap();
        assert_eq!(state.queue_name.as_deref(), Some("support"));
        assert_eq!(state.last_touched, at(5));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_finalize_once_then_redelivery() {
        let mut store = store();
        store.open("1.1", at(0)).agent = Some(AgentId(4));

        match store.finalize("1.1", at(10)) {
            Finalization::First(state) => assert_eq!(state.agent, Some(AgentId(4))),
            other => panic!("Expected First, got: {:?}", other),
        }
        assert!(store.get("1.1").is_none());

        match store.finalize("1.1", at(11)) {
            Finalization::Redelivery(state) => assert_eq!(state.agent, Some(AgentId(4))),
            other => panic!("Expected Redelivery, got: {:?}", other),
        }
        assert!(matches!(
            store.finalize("2.2", at(12)),
            Finalization::Untracked
        ));
        assert!(matches!(
            store.finalize("2.2", at(13)),
            Finalization::Redelivery(_)
        ));
    }

    #[test]
    fn test_sweep_evicts_past_ttl() {
        let mut store = store();
        store.open("old", at(0));
        store.open("fresh", at(7000));
        store.open("done", at(0));
        store.finalize("done", at(100));

        let stats = store.sweep(at(7201));
        assert_eq!(stats.evicted_active, 1);
        assert_eq!(stats.evicted_finalized, 0);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());

        let stats = store.sweep(at(7301));
        assert_eq!(stats.evicted_finalized, 1);
        assert_eq!(store.finalized_len(), 0);
    }

    #[test]
    fn test_stale_state_not_resurrected() {
        let mut store = store();
        store.open("1.1", at(0)).agent = Some(AgentId(1));
        let state = store.touch("1.1", at(8000)).unwrap();
        assert_eq!(state.agent, None);
    }

    #[test]
    fn test_late_event_keeps_finalized_state() {
        let mut store = store();
        store.open("1.1", at(0)).final_status = Some(FinalStatus::Abandoned);
        store.finalize("1.1", at(30));

        assert!(store.touch("1.1", at(31)).is_none());
        assert!(store.is_finalized("1.1"));
        assert_eq!(store.len(), 0);
        match store.finalize("1.1", at(40)) {
            Finalization::Redelivery(state) => {
                assert_eq!(state.final_status, Some(FinalStatus::Abandoned))
            }
            other => panic!("Expected Redelivery, got: {:?}", other),
        }
    }

    #[test]
    fn test_open_reuses_finalized_id() {
        let mut store = store();
        store.open("1.1", at(0)).agent = Some(AgentId(4));
        store.finalize("1.1", at(30));

        let state = store.open("1.1", at(50));
        assert_eq!(state.agent, None);
        assert!(!store.is_finalized("1.1"));
        assert!(matches!(store.finalize("1.1", at(60)), Finalization::First(_)));
    }

    #[test]
    fn test_hold_accumulates() {
        let mut state = CorrelationState::new("1.1", at(0));
        assert!(state.start_hold(at(10)));
        assert!(!state.start_hold(at(11)));
        assert!(state.end_hold(at(15)));
        assert!(!state.end_hold(at(16)));
        assert!(state.start_hold(at(20)));
        assert_eq!(state.hold_seconds(at(23)), 8);
        assert_eq!(state.hold_count, 2);
    }

    #[test]
    fn test_first_terminal_status_wins() {
        let mut state = CorrelationState::new("1.1", at(0));
        assert!(state.set_final_status(FinalStatus::Abandoned));
        assert!(!state.set_final_status(FinalStatus::Voicemail));
        assert_eq!(state.final_status, Some(FinalStatus::Abandoned));

        let mut state = CorrelationState::new("1.2", at(0));
        assert!(state.mark_transferred(Some("2002")));
        assert!(!state.mark_transferred(Some("3003")));
        assert_eq!(state.transfer_target.as_deref(), Some("2002"));
        assert_eq!(state.final_status, Some(FinalStatus::Transferred));
    }

    #[test]
    fn test_leave_queue_once() {
        let mut state = CorrelationState::new("1.1", at(0));
        state.waiting = true;
        assert!(state.leave_queue());
        assert!(!state.leave_queue());
    }
}
