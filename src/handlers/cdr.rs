//! CDR finalization: merge the call's correlation state with the CDR into
//! one call record.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde_json::json;
use tracing::info;

use super::seconds_between;
use crate::{
    constants::CALL_ID_PREFIX,
    correlation::{CorrelationState, FinalStatus, Finalization},
    dispatcher::{EventDispatcher, SinkWrite},
    error::AmiResult,
    event::AmiEvent,
    records::{CallDirection, CallRecord, CallStatus},
};

const INBOUND_CONTEXTS: &[&str] = &["from-pstn", "from-trunk", "from-external"];
const OUTBOUND_CONTEXTS: &[&str] = &["from-internal", "outbound", "to-pstn"];

/// Inbound/outbound from the destination context, then from the shape of
/// the numbers on a trunk channel. Defaults to outbound.
pub(crate) fn determine_direction(
    source: &str,
    destination: &str,
    channel: &str,
    context: &str,
) -> CallDirection {
    if INBOUND_CONTEXTS.contains(&context) {
        return CallDirection::Inbound;
    }
    if OUTBOUND_CONTEXTS.contains(&context) {
        return CallDirection::Outbound;
    }
    let trunk_channel = channel
        .strip_prefix("PJSIP/")
        .map(|rest| rest.chars().skip(1).any(|c| c == '-'))
        .unwrap_or(false);
    if trunk_channel && source.len() > 5 && destination.len() <= 5 {
        return CallDirection::Inbound;
    }
    CallDirection::Outbound
}

fn first_int(event: &AmiEvent, names: &[&str]) -> u64 {
    names
        .iter()
        .find(|name| event.header(name).map_or(false, |v| !v.trim().is_empty()))
        .map(|name| event.optional_int(name, 0).max(0) as u64)
        .unwrap_or(0)
}

fn first_datetime(
    event: &AmiEvent,
    names: &[&str],
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    names.iter().find_map(|name| event.datetime(name, offset))
}

fn status_for(state: &CorrelationState, disposition: &str) -> CallStatus {
    match state.final_status {
        Some(FinalStatus::Abandoned) => CallStatus::Abandoned,
        Some(FinalStatus::Voicemail) => CallStatus::Voicemail,
        Some(FinalStatus::Transferred) => CallStatus::Transferred,
        None => CallStatus::from_disposition(disposition),
    }
}

pub(crate) async fn handle_cdr(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let unique_id = event.require_call_id()?;
    let finalization = dispatcher
        .state
        .lock()
        .await
        .calls
        .finalize(unique_id, event.received_at());
    let (state, first) = match finalization {
        Finalization::First(state) => (state, true),
        Finalization::Redelivery(state) => {
            info!("[CDR] Redelivered CDR for {}", unique_id);
            (state, false)
        }
        Finalization::Untracked => (CorrelationState::new(unique_id, event.received_at()), true),
    };

    let agent = match state.agent {
        Some(agent) => Some(agent),
        None => {
            dispatcher
                .resolve_agent(event, &["DestinationChannel", "Channel"])
                .await?
        }
    };

    let source = event.first_header(&["Source", "CallerID"]).unwrap_or("");
    let destination = event
        .first_header(&["Destination", "CallerIDNum"])
        .unwrap_or("");
    let channel = event.header("Channel").unwrap_or("");
    let dst_channel = event.header("DestinationChannel").unwrap_or("");
    let context = event
        .first_header(&["DestinationContext", "Context"])
        .unwrap_or("");
    let disposition = event.header("Disposition").unwrap_or("ANSWERED");
    let duration = first_int(event, &["Duration"]);
    let billsec = first_int(event, &["BillableSeconds", "Billsec"]);

    let offset = dispatcher.cdr_offset;
    let start = first_datetime(event, &["StartTime", "Start"], offset)
        .unwrap_or_else(|| event.timestamp());
    let answer = first_datetime(event, &["AnswerTime", "Answer"], offset).or(state.connected_at);
    let end = first_datetime(event, &["EndTime", "End"], offset)
        .unwrap_or_else(|| start + Duration::seconds(duration as i64));

    // Queue entry and agent connect are both event timestamps; compare them
    // before mixing in the CDR's clock.
    let wait = match (state.queue_enter_time, state.connected_at) {
        (Some(entered), Some(connected)) => seconds_between(entered, connected),
        (Some(entered), None) => seconds_between(entered, answer.unwrap_or(end)),
        (None, _) => answer.map(|a| seconds_between(start, a)).unwrap_or(0),
    };
    let status = status_for(&state, disposition);
    let direction = determine_direction(source, destination, channel, context);
    let recording = dispatcher.recordings.find(unique_id).await;

    let record = CallRecord {
        call_id: format!("{}{}", CALL_ID_PREFIX, unique_id),
        unique_id: unique_id.to_string(),
        channel: channel.to_string(),
        direction,
        status,
        caller_id: non_empty_or_unknown(source),
        called_number: non_empty_or_unknown(destination),
        start_time: start,
        answer_time: answer,
        end_time: end,
        wait_time: wait,
        talk_time: billsec,
        hold_time: state.hold_seconds(end),
        agent,
        queue: state.queue,
        recording,
        transferred: state.transferred,
        transfer_target: state.transfer_target.clone(),
        metadata: json!({
            "ami_channel": channel,
            "ami_dst_channel": dst_channel,
            "ami_context": context,
            "ami_disposition": disposition,
            "ami_duration": duration,
            "ami_accountcode": event.header("AccountCode").unwrap_or(""),
            "queue_name": state.queue_name,
            "mailbox": state.mailbox,
            "hold_count": state.hold_count,
            "ring_no_answer_count": state.ring_no_answer_count,
        }),
    };

    info!(
        "[CDR] {} {} -> {} {} {} dur={}s bill={}s",
        record.call_id,
        record.caller_id,
        record.called_number,
        direction.as_str(),
        status,
        duration,
        billsec
    );

    let mut writes = vec![SinkWrite::Call(Box::new(record))];
    if first {
        let mut tracker = dispatcher.state.lock().await;
        // Events trailing the CDR are dropped, so a caller still counted as
        // waiting leaves the queue here.
        if let (true, Some(queue)) = (state.waiting, state.queue) {
            writes.push(SinkWrite::Queue(tracker.queues.caller_left(queue)));
        }
        if let (CallStatus::Completed, Some(agent)) = (status, agent) {
            writes.push(SinkWrite::Agent(tracker.agents.record_call(agent, billsec)));
        }
    }
    Ok(writes)
}

fn non_empty_or_unknown(value: &str) -> String {
    if value.is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AmiEventType;
    use crate::handlers::test_support::*;
    use crate::records::AgentId;

    fn cdr(unique_id: &str) -> AmiEvent {
        event(AmiEventType::Cdr, 100)
            .with_header("UniqueID", unique_id)
            .with_header("Source", "5551234567")
            .with_header("Destination", "100")
            .with_header("Channel", "PJSIP/trunk-00000001")
            .with_header("DestinationChannel", "PJSIP/1001-00000002")
            .with_header("DestinationContext", "from-pstn")
            .with_header("Disposition", "ANSWERED")
            .with_header("Duration", "90")
            .with_header("BillableSeconds", "60")
            .with_header("StartTime", "2023-11-14 22:13:20")
            .with_header("AnswerTime", "2023-11-14 22:13:50")
            .with_header("EndTime", "2023-11-14 22:14:50")
    }

    #[test]
    fn test_direction() {
        assert_eq!(
            determine_direction("5551234567", "100", "PJSIP/x-1", "from-trunk"),
            CallDirection::Inbound
        );
        assert_eq!(
            determine_direction("1001", "5551234567", "PJSIP/1001-1", "from-internal"),
            CallDirection::Outbound
        );
        assert_eq!(
            determine_direction("5551234567", "100", "PJSIP/carrier-0000a", "custom"),
            CallDirection::Inbound
        );
        assert_eq!(
            determine_direction("5551234567", "100", "SIP/carrier-0000a", "custom"),
            CallDirection::Outbound
        );
        assert_eq!(
            determine_direction("", "", "", ""),
            CallDirection::Outbound
        );
    }

    #[tokio::test]
    async fn test_untracked_cdr() {
        let (d, sink) = dispatcher();
        d.dispatch(&cdr("1700000000.1")).await.unwrap();

        let record = sink.call("ast-1700000000.1").await.unwrap();
        assert_eq!(record.status, CallStatus::Completed);
        assert_eq!(record.direction, CallDirection::Inbound);
        assert_eq!(record.agent, Some(AGENT));
        assert_eq!(record.wait_time, 30);
        assert_eq!(record.talk_time, 60);
        assert_eq!(record.hold_time, 0);
        assert_eq!(record.duration(), 90);
        assert_eq!(record.metadata["ami_disposition"], "ANSWERED");
        assert!(!record.is_recorded());

        let row = sink.agent(AGENT).await.unwrap();
        assert_eq!(row.totals.calls, 1);
        assert_eq!(row.totals.talk_time, 60);
    }

    #[tokio::test]
    async fn test_redelivered_cdr_counts_once() {
        let (d, sink) = dispatcher();
        d.dispatch(&cdr("1700000000.2")).await.unwrap();
        d.dispatch(&cdr("1700000000.2")).await.unwrap();

        assert_eq!(sink.calls().await.len(), 1);
        assert_eq!(sink.call_writes().await, 2);
        assert_eq!(sink.agent(AGENT).await.unwrap().totals.calls, 1);
    }

    #[tokio::test]
    async fn test_missing_times_and_unknowns() {
        let (d, sink) = dispatcher();
        let event = event(AmiEventType::Cdr, 0)
            .with_header("Uniqueid", "1700000000.3")
            .with_header("Disposition", "NO ANSWER")
            .with_header("Duration", "20")
            .with_header("Channel", "PJSIP/9999-00000001");
        d.dispatch(&event).await.unwrap();

        let record = sink.call("ast-1700000000.3").await.unwrap();
        assert_eq!(record.status, CallStatus::NoAnswer);
        assert_eq!(record.caller_id, "unknown");
        assert_eq!(record.called_number, "unknown");
        assert_eq!(record.start_time.timestamp(), 1_700_000_000);
        assert_eq!(record.duration(), 20);
        assert_eq!(record.answer_time, None);
        assert_eq!(record.wait_time, 0);
        assert_eq!(record.agent, None::<AgentId>);
    }
}
