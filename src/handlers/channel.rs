//! Channel-level events: hold, unhold, transfers, voicemail

use tracing::{debug, info};

use crate::{
    correlation::FinalStatus,
    dispatcher::{EventDispatcher, SinkWrite},
    error::{AmiError, AmiResult},
    event::{AmiEvent, AmiEventType},
};

const BLIND_LEGS: &[&str] = &["TransfereeUniqueid", "TransfererUniqueid"];
const BLIND_TARGET: &[&str] = &["Extension"];
const ATTENDED_LEGS: &[&str] = &["TransfereeUniqueid", "OrigTransfererUniqueid"];
const ATTENDED_TARGET: &[&str] = &[
    "SecondTransfererExten",
    "TransferTargetCallerIDNum",
    "TransferTargetChannel",
];

pub(crate) async fn handle_hold(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let mut state = dispatcher.state.lock().await;
    let call = match state.calls.touch(call_id, event.received_at()) {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    if !call.start_hold(event.timestamp()) {
        debug!("[CHANNEL] {} already on hold", call_id);
    }
    Ok(Vec::new())
}

pub(crate) async fn handle_unhold(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let mut state = dispatcher.state.lock().await;
    let call = match state.calls.touch(call_id, event.received_at()) {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    if !call.end_hold(event.timestamp()) {
        debug!("[CHANNEL] Unhold without hold for {}", call_id);
    }
    Ok(Vec::new())
}

/// Blind and attended transfers. Every call leg named in the event is
/// marked transferred, and only when the transfer succeeded.
pub(crate) async fn handle_transfer(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let result = event.header("Result").unwrap_or("");
    if !result.eq_ignore_ascii_case("Success") {
        info!(
            "[CHANNEL] Ignoring {} with result {:?}",
            event.event_type(),
            result
        );
        return Ok(Vec::new());
    }

    let (id_headers, target_headers) = match event.event_type() {
        AmiEventType::AttendedTransfer => (ATTENDED_LEGS, ATTENDED_TARGET),
        _ => (BLIND_LEGS, BLIND_TARGET),
    };

    let legs: Vec<&str> = id_headers
        .iter()
        .filter_map(|name| event.header(name))
        .filter(|id| !id.is_empty())
        .collect();
    if legs.is_empty() {
        return Err(AmiError::missing_header(
            event.event_type().as_str(),
            id_headers[0],
        ));
    }
    let target = event.first_header(target_headers);

    let mut state = dispatcher.state.lock().await;
    for leg in legs {
        let call = match state.calls.touch(leg, event.received_at()) {
            Some(call) => call,
            None => continue,
        };
        if call.mark_transferred(target) {
            debug!(
                "[CHANNEL] {} transferred to {}",
                leg,
                target.unwrap_or("?")
            );
        }
    }
    Ok(Vec::new())
}

pub(crate) async fn handle_voicemail(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let call_id = event.require_call_id()?;
    let mailbox = event.first_header(&["Mailbox", "VoiceMailbox"]);

    let mut state = dispatcher.state.lock().await;
    let call = match state.calls.touch(call_id, event.received_at()) {
        Some(call) => call,
        None => return Ok(Vec::new()),
    };
    if call.set_final_status(FinalStatus::Voicemail) {
        call.mailbox = mailbox.map(str::to_string);
        debug!(
            "[CHANNEL] {} went to voicemail {}",
            call_id,
            mailbox.unwrap_or("?")
        );
    }
    Ok(Vec::new())
}
