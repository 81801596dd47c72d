//! Queue lifecycle: join, abandon, leave, agent connect/complete, ring-no-answer

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::seconds_between;
use crate::{
    correlation::{CorrelationState, FinalStatus},
    dispatcher::{EventDispatcher, SinkWrite},
    error::AmiResult,
    event::AmiEvent,
    records::QueueRef,
};

const AGENT_HEADERS: &[&str] = &["Interface", "DestChannel"];

/// Queue entry time from the `HoldTime` header, when the join was missed
fn backfill_enter_time(call: &mut CorrelationState, event: &AmiEvent, at: DateTime<Utc>) {
    if call.queue_enter_time.is_some() {
        return;
    }
    let held = event.optional_int("HoldTime", -1);
    if held >= 0 {
        call.queue_enter_time = Some(at - Duration::seconds(held));
    }
}

fn link_queue(call: &mut CorrelationState, event: &AmiEvent, queue: Option<&QueueRef>) {
    if call.queue.is_none() {
        call.queue = queue.map(|q| q.id);
    }
    if call.queue_name.is_none() {
        call.queue_name = event.header("Queue").map(str::to_string);
    }
}

pub(crate) async fn handle_join(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let queue = dispatcher.resolve_queue(event).await?;
    let at = event.timestamp();

    let mut guard = dispatcher.state.lock().await;
    let state = &mut *guard;
    let call = state.calls.open(call_id, event.received_at());
    if call.queue_enter_time.is_some() {
        debug!("[QUEUE] Duplicate join for {}", call_id);
        return Ok(Vec::new());
    }
    call.queue_enter_time = Some(at);
    link_queue(call, event, queue.as_ref());

    let mut writes = Vec::new();
    if let Some(queue) = &queue {
        call.waiting = true;
        writes.push(SinkWrite::Queue(state.queues.caller_joined(queue.id)));
    }
    debug!(
        "[QUEUE] {} joined {}",
        call_id,
        event.header("Queue").unwrap_or("?")
    );
    Ok(writes)
}

pub(crate) async fn handle_abandon(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let queue = dispatcher.resolve_queue(event).await?;
    let at = event.timestamp();

    let mut guard = dispatcher.state.lock().await;
    let state = &mut *guard;
    let call = match state.calls.touch(call_id, event.received_at()) {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    if !call.set_final_status(FinalStatus::Abandoned) {
        debug!("[QUEUE] Ignoring abandon for {}", call_id);
        return Ok(Vec::new());
    }
    backfill_enter_time(call, event, at);
    link_queue(call, event, queue.as_ref());
    let was_waiting = call.leave_queue();
    let queue_id = call.queue;

    let mut writes = Vec::new();
    if let Some(queue_id) = queue_id {
        writes.push(SinkWrite::Queue(
            state.queues.caller_abandoned(queue_id, was_waiting),
        ));
    }
    debug!("[QUEUE] {} abandoned", call_id);
    Ok(writes)
}

/// Caller left the queue. Only moves the waiting gauge; the outcome comes
/// from abandon, connect or the CDR.
pub(crate) async fn handle_leave(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;

    let mut guard = dispatcher.state.lock().await;
    let state = &mut *guard;
    let call = match state.calls.touch(call_id, event.received_at()) {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    let was_waiting = call.leave_queue();
    let queue_id = call.queue;

    match queue_id {
        Some(queue_id) if was_waiting => {
            Ok(vec![SinkWrite::Queue(state.queues.caller_left(queue_id))])
        }
        _ => Ok(Vec::new()),
    }
}

pub(crate) async fn handle_agent_connect(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let agent = dispatcher.resolve_agent(event, AGENT_HEADERS).await?;
    let queue = dispatcher.resolve_queue(event).await?;
    let at = event.timestamp();

    let mut guard = dispatcher.state.lock().await;
    let state = &mut *guard;
    let call = state.calls.open(call_id, event.received_at());
    if call.connected_at.is_some() {
        debug!("[QUEUE] Duplicate connect for {}", call_id);
        return Ok(Vec::new());
    }
    call.connected_at = Some(at);
    if agent.is_some() {
        call.agent = agent;
    }
    backfill_enter_time(call, event, at);
    link_queue(call, event, queue.as_ref());
    let was_waiting = call.leave_queue();
    let wait = call
        .queue_enter_time
        .map(|entered| seconds_between(entered, at))
        .unwrap_or(0);

    let mut writes = Vec::new();
    if let Some(agent) = agent {
        let change = state.agents.call_connected(agent, at);
        state.presence_writes(change, &mut writes);
    }
    if let Some(queue) = &queue {
        writes.push(SinkWrite::Queue(state.queues.call_connected(
            queue.id,
            wait,
            was_waiting,
            queue.service_level,
        )));
    }
    debug!("[QUEUE] {} connected after {}s", call_id, wait);
    Ok(writes)
}

pub(crate) async fn handle_agent_complete(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let agent = dispatcher.resolve_agent(event, AGENT_HEADERS).await?;
    let queue = dispatcher.resolve_queue(event).await?;
    let talk = event.optional_int("TalkTime", 0).max(0) as u64;
    let at = event.timestamp();

    let mut guard = dispatcher.state.lock().await;
    let state = &mut *guard;
    // The agent may hang up after the CDR went out. Presence still moves;
    // the finalized call only records that it completed.
    let late = state.calls.is_finalized(call_id);
    let call = if late {
        state.calls.finalized_mut(call_id)
    } else {
        state.calls.touch(call_id, event.received_at())
    };
    let call = match call {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    if call.agent_completed {
        debug!("[QUEUE] Duplicate complete for {}", call_id);
        return Ok(Vec::new());
    }
    call.agent_completed = true;
    let agent = agent.or(call.agent);
    if !late {
        if call.agent.is_none() {
            call.agent = agent;
        }
        link_queue(call, event, queue.as_ref());
    }

    let mut writes = Vec::new();
    if let Some(agent) = agent {
        let change = state.agents.call_completed(agent, queue.as_ref(), at);
        state.presence_writes(change, &mut writes);
        if let Some(queue) = &queue {
            writes.push(SinkWrite::MemberCall {
                queue: queue.id,
                agent,
                at,
            });
        }
    }
    if let Some(queue) = &queue {
        writes.push(SinkWrite::Queue(state.queues.call_completed(queue.id, talk)));
    }
    Ok(writes)
}

/// Diagnostic only: counted on the call, no durable effect
pub(crate) async fn handle_ring_no_answer(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let mut state = dispatcher.state.lock().await;
    let call = match state.calls.touch(call_id, event.received_at()) {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    call.ring_no_answer_count += 1;
    debug!(
        "[QUEUE] {} not answered by {} ({} so far)",
        call_id,
        event.first_header(AGENT_HEADERS).unwrap_or("?"),
        call.ring_no_answer_count
    );
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use crate::event::AmiEventType;
    use crate::handlers::test_support::*;
    use crate::presence::AgentStatus;

    fn join(call: &str, queue: &str, offset: i64) -> crate::event::AmiEvent {
        event(AmiEventType::QueueCallerJoin, offset)
            .with_header("Uniqueid", call)
            .with_header("Queue", queue)
    }

    #[tokio::test]
    async fn test_join_counts_waiting_once() {
        let (d, sink) = dispatcher();
        d.dispatch(&join("1.1", "support", 0)).await.unwrap();
        d.dispatch(&join("1.1", "support", 1)).await.unwrap();

        let stats = d.queue_stats(SUPPORT).await.unwrap();
        assert_eq!(stats.calls_waiting, 1);
        assert_eq!(sink.queue_stats(SUPPORT).await.unwrap().calls_waiting, 1);
    }

    #[tokio::test]
    async fn test_abandon_then_leave() {
        let (d, sink) = dispatcher();
        d.dispatch(&join("1.1", "support", 0)).await.unwrap();
        let abandon = event(AmiEventType::QueueCallerAbandon, 40)
            .with_header("Uniqueid", "1.1")
            .with_header("Queue", "support");
        d.dispatch(&abandon).await.unwrap();
        d.dispatch(&abandon).await.unwrap();
        let leave = event(AmiEventType::QueueCallerLeave, 40)
            .with_header("Uniqueid", "1.1")
            .with_header("Queue", "support");
        d.dispatch(&leave).await.unwrap();

        let row = sink.queue_stats(SUPPORT).await.unwrap();
        assert_eq!(row.calls_waiting, 0);
        assert_eq!(row.calls_abandoned, 1);
        let call = d.call_state("1.1").await.unwrap();
        assert_eq!(call.final_status, Some(crate::correlation::FinalStatus::Abandoned));
    }

    #[tokio::test]
    async fn test_connect_and_complete() {
        let (d, sink) = dispatcher();
        d.dispatch(&join("1.1", "support", 0)).await.unwrap();
        let connect = event(AmiEventType::AgentConnect, 12)
            .with_header("Uniqueid", "1.1")
            .with_header("Queue", "support")
            .with_header("Interface", "PJSIP/1001");
        d.dispatch(&connect).await.unwrap();
        d.dispatch(&connect).await.unwrap();

        let agent = d.agent_state(AGENT).await.unwrap();
        assert_eq!(agent.status, AgentStatus::OnCall);
        assert_eq!(agent.current_calls, 1);
        let stats = d.queue_stats(SUPPORT).await.unwrap();
        assert_eq!(stats.calls_waiting, 0);
        assert_eq!(stats.calls_completed, 1);
        assert_eq!(stats.service_level_met, 1);
        assert_eq!(stats.max_wait_time, 12);

        let complete = event(AmiEventType::AgentComplete, 72)
            .with_header("Uniqueid", "1.1")
            .with_header("Queue", "support")
            .with_header("Interface", "PJSIP/1001")
            .with_header("TalkTime", "60");
        d.dispatch(&complete).await.unwrap();
        d.dispatch(&complete).await.unwrap();

        let agent = d.agent_state(AGENT).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert_eq!(agent.current_calls, 0);
        assert_eq!(agent.totals.oncall_time, 60);
        let member = sink.member_calls(SUPPORT, AGENT).await.unwrap();
        assert_eq!(member.calls_taken, 1);
        assert_eq!(d.queue_stats(SUPPORT).await.unwrap().avg_talk_time(), 60);
    }

    #[tokio::test]
    async fn test_complete_enters_wrapup() {
        let (d, _sink) = dispatcher();
        let connect = event(AmiEventType::AgentConnect, 0)
            .with_header("Uniqueid", "2.1")
            .with_header("Queue", "sales")
            .with_header("Interface", "PJSIP/1001")
            .with_header("HoldTime", "25");
        d.dispatch(&connect).await.unwrap();
        let stats = d.queue_stats(SALES).await.unwrap();
        assert_eq!(stats.max_wait_time, 25);
        assert_eq!(stats.service_level_met, 1);

        let complete = event(AmiEventType::AgentComplete, 30)
            .with_header("Uniqueid", "2.1")
            .with_header("Queue", "sales")
            .with_header("Interface", "PJSIP/1001");
        d.dispatch(&complete).await.unwrap();
        let agent = d.agent_state(AGENT).await.unwrap();
        assert_eq!(agent.status, AgentStatus::WrapUp);

        let until = agent.wrapup_until.unwrap();
        d.expire_wrapups(until).await.unwrap();
        assert_eq!(
            d.agent_state(AGENT).await.unwrap().status,
            AgentStatus::Available
        );
    }

    #[tokio::test]
    async fn test_unknown_queue_keeps_correlation() {
        let (d, sink) = dispatcher();
        d.dispatch(&join("3.1", "billing", 0)).await.unwrap();
        let call = d.call_state("3.1").await.unwrap();
        assert_eq!(call.queue, None);
        assert_eq!(call.queue_name.as_deref(), Some("billing"));
        assert!(call.queue_enter_time.is_some());
        assert!(!call.waiting);
        assert!(sink.queue_stats(SUPPORT).await.is_none());
    }

    #[tokio::test]
    async fn test_ring_no_answer_counted() {
        let (d, _sink) = dispatcher();
        let rna = event(AmiEventType::AgentRingNoAnswer, 0)
            .with_header("Uniqueid", "4.1")
            .with_header("Interface", "PJSIP/1002");
        d.dispatch(&rna).await.unwrap();
        d.dispatch(&rna).await.unwrap();
        assert_eq!(d.call_state("4.1").await.unwrap().ring_no_answer_count, 2);
    }

    #[tokio::test]
    async fn test_missing_uniqueid_is_rejected() {
        let (d, _sink) = dispatcher();
        let err = d
            .dispatch(&event(AmiEventType::QueueCallerJoin, 0).with_header("Queue", "support"))
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(d.open_calls().await, 0);
    }
}
