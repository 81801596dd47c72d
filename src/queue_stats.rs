//! Rolling per-queue counters.
//!
//! The aggregator keeps its own view of each queue so it can report averages
//! and gauges, and emits [`QueueStatsUpdate`]s carrying the relative change
//! for the sink to apply.

use serde::Serialize;
use std::collections::HashMap;

use crate::presence::AgentStatus;
use crate::records::{AgentId, QueueId, QueueStatsUpdate};

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queue: Option<QueueId>,
    pub calls_waiting: u64,
    pub calls_completed: u64,
    pub calls_abandoned: u64,
    pub service_level_met: u64,
    pub total_wait_time: u64,
    pub max_wait_time: u64,
    pub total_talk_time: u64,
    pub talk_samples: u64,
    /// Last known status of each member, for the agent gauges
    #[serde(skip)]
    pub members: HashMap<AgentId, AgentStatus>,
}

impl QueueStats {
    fn new(queue: QueueId) -> Self {
        Self {
            queue: Some(queue),
            ..Default::default()
        }
    }

    pub fn avg_wait_time(&self) -> u64 {
        if self.calls_completed == 0 {
            0
        } else {
            self.total_wait_time / self.calls_completed
        }
    }

    pub fn avg_talk_time(&self) -> u64 {
        if self.talk_samples == 0 {
            0
        } else {
            self.total_talk_time / self.talk_samples
        }
    }

    /// Share of finished calls answered within the threshold, 0-100
    pub fn service_level_percentage(&self) -> f64 {
        let total = self.calls_completed + self.calls_abandoned;
        if total == 0 {
            0.0
        } else {
            self.service_level_met as f64 / total as f64 * 100.0
        }
    }

    pub fn agents_available(&self) -> u32 {
        self.members
            .values()
            .filter(|s| **s == AgentStatus::Available)
            .count() as u32
    }

    pub fn agents_busy(&self) -> u32 {
        self.members.values().filter(|s| s.is_engaged()).count() as u32
    }
}

#[derive(Debug, Default)]
pub struct QueueStatsAggregator {
    queues: HashMap<QueueId, QueueStats>,
}

impl QueueStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, queue: QueueId) -> Option<&QueueStats> {
        self.queues.get(&queue)
    }

    fn entry(&mut self, queue: QueueId) -> &mut QueueStats {
        self.queues
            .entry(queue)
            .or_insert_with(|| QueueStats::new(queue))
    }

    pub fn caller_joined(&mut self, queue: QueueId) -> QueueStatsUpdate {
        let stats = self.entry(queue);
        stats.calls_waiting += 1;
        let mut update = QueueStatsUpdate::new(queue);
        update.deltas.calls_waiting = 1;
        update
    }

    /// Caller left without being answered or abandoning (timeout, exit key)
    pub fn caller_left(&mut self, queue: QueueId) -> QueueStatsUpdate {
        let stats = self.entry(queue);
        stats.calls_waiting = stats.calls_waiting.saturating_sub(1);
        let mut update = QueueStatsUpdate::new(queue);
        update.deltas.calls_waiting = -1;
        update
    }

    pub fn caller_abandoned(&mut self, queue: QueueId, was_waiting: bool) -> QueueStatsUpdate {
        let stats = self.entry(queue);
        stats.calls_abandoned += 1;
        let mut update = QueueStatsUpdate::new(queue);
        update.deltas.calls_abandoned = 1;
        if was_waiting {
            stats.calls_waiting = stats.calls_waiting.saturating_sub(1);
            update.deltas.calls_waiting = -1;
        }
        update.gauges.service_level_percentage = Some(stats.service_level_percentage());
        update
    }

    /// An agent answered after `wait_secs` in queue
    pub fn call_connected(
        &mut self,
        queue: QueueId,
        wait_secs: u64,
        was_waiting: bool,
        service_level: u32,
    ) -> QueueStatsUpdate {
        let stats = self.entry(queue);
        let mut update = QueueStatsUpdate::new(queue);

        stats.calls_completed += 1;
        update.deltas.calls_completed = 1;
        if was_waiting {
            stats.calls_waiting = stats.calls_waiting.saturating_sub(1);
            update.deltas.calls_waiting = -1;
        }
        if wait_secs <= u64::from(service_level) {
            stats.service_level_met += 1;
            update.deltas.service_level_met = 1;
        }
        stats.total_wait_time += wait_secs;
        stats.max_wait_time = stats.max_wait_time.max(wait_secs);

        update.gauges.avg_wait_time = Some(stats.avg_wait_time());
        update.gauges.max_wait_time = Some(stats.max_wait_time);
        update.gauges.service_level_percentage = Some(stats.service_level_percentage());
        update
    }

    pub fn call_completed(&mut self, queue: QueueId, talk_secs: u64) -> QueueStatsUpdate {
        let stats = self.entry(queue);
        stats.total_talk_time += talk_secs;
        stats.talk_samples += 1;
        let mut update = QueueStatsUpdate::new(queue);
        update.gauges.avg_talk_time = Some(stats.avg_talk_time());
        update
    }

    /// Record a member's status in one queue. `None` if the gauges did not move.
    pub fn member_status(
        &mut self,
        queue: QueueId,
        agent: AgentId,
        status: AgentStatus,
    ) -> Option<QueueStatsUpdate> {
        let stats = self.entry(queue);
        if stats.members.get(&agent) == Some(&status) {
            return None;
        }
        stats.members.insert(agent, status);
        Some(gauge_update(queue, stats))
    }

    /// Propagate an agent's new status to every queue it is a member of
    pub fn agent_status_changed(
        &mut self,
        agent: AgentId,
        status: AgentStatus,
    ) -> Vec<QueueStatsUpdate> {
        let mut updates = Vec::new();
        for (queue, stats) in self.queues.iter_mut() {
            match stats.members.get_mut(&agent) {
                Some(current) if *current != status => {
                    *current = status;
                    updates.push(gauge_update(*queue, stats));
                }
                _ => {}
            }
        }
        updates.sort_by_key(|u| u.queue);
        updates
    }
}

fn gauge_update(queue: QueueId, stats: &QueueStats) -> QueueStatsUpdate {
    let mut update = QueueStatsUpdate::new(queue);
    update.gauges.agents_available = Some(stats.agents_available());
    update.gauges.agents_busy = Some(stats.agents_busy());
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: QueueId = QueueId(1);

    #[test]
    fn test_join_then_answer() {
        let mut agg = QueueStatsAggregator::new();
        let join = agg.caller_joined(Q);
        assert_eq!(join.deltas.calls_waiting, 1);

        let answer = agg.call_connected(Q, 12, true, 20);
        assert_eq!(answer.deltas.calls_waiting, -1);
        assert_eq!(answer.deltas.calls_completed, 1);
        assert_eq!(answer.deltas.service_level_met, 1);
        assert_eq!(answer.gauges.avg_wait_time, Some(12));
        assert_eq!(answer.gauges.service_level_percentage, Some(100.0));

        let stats = agg.stats(Q).unwrap();
        assert_eq!(stats.calls_waiting, 0);
        assert_eq!(stats.calls_completed, 1);
    }

    #[test]
    fn test_service_level_includes_abandons() {
        let mut agg = QueueStatsAggregator::new();
        agg.caller_joined(Q);
        agg.caller_joined(Q);
        agg.caller_joined(Q);
        agg.call_connected(Q, 10, true, 20);
        agg.call_connected(Q, 45, true, 20);
        let abandon = agg.caller_abandoned(Q, true);
        assert_eq!(abandon.deltas.calls_abandoned, 1);
        assert_eq!(abandon.deltas.calls_waiting, -1);

        let stats = agg.stats(Q).unwrap();
        assert_eq!(stats.calls_waiting, 0);
        assert_eq!(stats.max_wait_time, 45);
        assert_eq!(stats.avg_wait_time(), 27);
        let sl = stats.service_level_percentage();
        assert!((sl - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_waiting_floors_at_zero() {
        let mut agg = QueueStatsAggregator::new();
        agg.caller_left(Q);
        assert_eq!(agg.stats(Q).unwrap().calls_waiting, 0);
        let abandon = agg.caller_abandoned(Q, false);
        assert_eq!(abandon.deltas.calls_waiting, 0);
    }

    #[test]
    fn test_member_gauges() {
        let mut agg = QueueStatsAggregator::new();
        let a = AgentId(1);
        let b = AgentId(2);
        agg.member_status(Q, a, AgentStatus::Available).unwrap();
        let update = agg.member_status(Q, b, AgentStatus::OnCall).unwrap();
        assert_eq!(update.gauges.agents_available, Some(1));
        assert_eq!(update.gauges.agents_busy, Some(1));
        assert!(agg.member_status(Q, b, AgentStatus::OnCall).is_none());

        let updates = agg.agent_status_changed(a, AgentStatus::Break);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].gauges.agents_available, Some(0));
        assert_eq!(updates[0].gauges.agents_busy, Some(1));
        assert!(agg.agent_status_changed(AgentId(3), AgentStatus::Break).is_empty());
    }

    #[test]
    fn test_avg_talk() {
        let mut agg = QueueStatsAggregator::new();
        agg.call_completed(Q, 30);
        let update = agg.call_completed(Q, 60);
        assert_eq!(update.gauges.avg_talk_time, Some(45));
    }
}
