//! Agent presence events: member status, pause, login, logoff

use tracing::debug;

use crate::{
    dispatcher::{EventDispatcher, SinkWrite},
    error::AmiResult,
    event::AmiEvent,
    presence::AgentStatus,
};

const MEMBER_HEADERS: &[&str] = &["Interface", "StateInterface", "Location"];

pub(crate) async fn handle_member_status(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let code = event.optional_int("Status", 0);
    let mapped = match AgentStatus::from_member_status(code) {
        Some(status) => status,
        None => {
            debug!("[AGENT] Ignoring member status {}", code);
            return Ok(Vec::new());
        }
    };
    let agent = match dispatcher.resolve_agent(event, MEMBER_HEADERS).await? {
        Some(agent) => agent,
        None => return Ok(Vec::new()),
    };
    let queue = dispatcher.resolve_queue(event).await?;
    let paused = event.flag("Paused");
    let status = if paused && mapped == AgentStatus::Available {
        AgentStatus::Break
    } else {
        mapped
    };
    let at = event.timestamp();

    let mut guard = dispatcher.state.lock().await;
    let state = &mut *guard;
    let mut writes = Vec::new();
    if let Some(queue) = &queue {
        if let Some(update) = state.queues.member_status(queue.id, agent, status) {
            writes.push(SinkWrite::Queue(update));
        }
    }

    let change = if status == AgentStatus::Break {
        state
            .agents
            .set_paused(agent, true, event.header("PausedReason"), at)
    } else {
        state.agents.transition(agent, status, at)
    };
    if let Some(change) = change {
        state.presence_writes(change, &mut writes);
    }
    Ok(writes)
}

pub(crate) async fn handle_pause(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    let agent = match dispatcher.resolve_agent(event, MEMBER_HEADERS).await? {
        Some(agent) => agent,
        None => return Ok(Vec::new()),
    };
    let paused = event.flag("Paused");
    let reason = event.first_header(&["PausedReason", "Reason"]);
    let at = event.timestamp();

    let mut state = dispatcher.state.lock().await;
    let mut writes = Vec::new();
    if let Some(change) = state.agents.set_paused(agent, paused, reason, at) {
        state.presence_writes(change, &mut writes);
    }
    Ok(writes)
}

pub(crate) async fn handle_login(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    event.require("Agent")?;
    let agent = match dispatcher.resolve_agent(event, &["Agent"]).await? {
        Some(agent) => agent,
        None => return Ok(Vec::new()),
    };

    let mut state = dispatcher.state.lock().await;
    let change = state.agents.login(agent, event.timestamp());
    let mut writes = Vec::new();
    state.presence_writes(change, &mut writes);
    Ok(writes)
}

pub(crate) async fn handle_logoff(
    dispatcher: &EventDispatcher,
    event: &AmiEvent,
) -> AmiResult<Vec<SinkWrite>> {
    event.require("Agent")?;
    let agent = match dispatcher.resolve_agent(event, &["Agent"]).await? {
        Some(agent) => agent,
        None => return Ok(Vec::new()),
    };

    let mut state = dispatcher.state.lock().await;
    let change = state.agents.logoff(agent, event.timestamp());
    let mut writes = Vec::new();
    state.presence_writes(change, &mut writes);
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use crate::event::AmiEventType;
    use crate::handlers::test_support::*;
    use crate::presence::AgentStatus;

    fn member_status(code: &str, offset: i64) -> crate::event::AmiEvent {
        event(AmiEventType::QueueMemberStatus, offset)
            .with_header("Queue", "support")
            .with_header("Interface", "PJSIP/1001")
            .with_header("Status", code)
    }

    #[tokio::test]
    async fn test_member_status_history() {
        let (d, sink) = dispatcher();
        d.dispatch(&member_status("1", 0)).await.unwrap();
        d.dispatch(&member_status("2", 30)).await.unwrap();
        d.dispatch(&member_status("2", 35)).await.unwrap();
        d.dispatch(&member_status("0", 40)).await.unwrap();

        let history = sink.history(AGENT).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, AgentStatus::Available);
        assert_eq!(history[0].duration, 30);
        assert!(!history[0].is_open());
        assert_eq!(history[1].status, AgentStatus::OnCall);
        assert!(history[1].is_open());

        let row = sink.agent(AGENT).await.unwrap();
        assert_eq!(row.status, AgentStatus::OnCall);
        assert_eq!(row.totals.available_time, 30);

        let stats = sink.queue_stats(SUPPORT).await.unwrap();
        assert_eq!(stats.agents_available, 0);
        assert_eq!(stats.agents_busy, 1);
    }

    #[tokio::test]
    async fn test_paused_member_goes_on_break() {
        let (d, _sink) = dispatcher();
        d.dispatch(&member_status("1", 0).with_header("Paused", "1").with_header("PausedReason", "training"))
            .await
            .unwrap();
        let agent = d.agent_state(AGENT).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Break);
        assert_eq!(agent.pause_reason.as_deref(), Some("training"));
    }

    #[tokio::test]
    async fn test_pause_unpause() {
        let (d, sink) = dispatcher();
        let pause = |paused: &str, offset| {
            event(AmiEventType::QueueMemberPause, offset)
                .with_header("Interface", "PJSIP/1001")
                .with_header("Paused", paused)
                .with_header("PausedReason", "lunch")
        };
        d.dispatch(&pause("1", 0)).await.unwrap();
        d.dispatch(&pause("0", 600)).await.unwrap();

        let row = sink.agent(AGENT).await.unwrap();
        assert_eq!(row.status, AgentStatus::Available);
        assert_eq!(row.totals.break_time, 600);
    }

    #[tokio::test]
    async fn test_login_logoff() {
        let (d, sink) = dispatcher();
        let login = event(AmiEventType::AgentLogin, 0).with_header("Agent", "1001");
        d.dispatch(&login).await.unwrap();
        let row = sink.agent(AGENT).await.unwrap();
        assert_eq!(row.status, AgentStatus::Available);
        assert!(row.logged_in_at.is_some());

        let logoff = event(AmiEventType::AgentLogoff, 3600).with_header("Agent", "1001");
        d.dispatch(&logoff).await.unwrap();
        let row = sink.agent(AGENT).await.unwrap();
        assert_eq!(row.status, AgentStatus::Offline);
        assert_eq!(row.logged_in_at, None);
        assert_eq!(row.totals.available_time, 3600);
    }

    #[tokio::test]
    async fn test_unknown_agent_ignored() {
        let (d, _sink) = dispatcher();
        let login = event(AmiEventType::AgentLogin, 0).with_header("Agent", "4242");
        d.dispatch(&login).await.unwrap();
        let missing = event(AmiEventType::AgentLogin, 0);
        assert!(d.dispatch(&missing).await.unwrap_err().is_protocol_error());
    }
}
