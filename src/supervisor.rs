//! Connection supervisor.
//!
//! Owns the single worker task that connects, logs in, reads frames and
//! hands events to the [`EventDispatcher`]. On any transport failure the
//! worker backs off exponentially and reconnects; a successful login resets
//! the delay. [`Supervisor::stop`] is observed between frames and during
//! every wait, so no frame is dispatched after stop returns. A worker
//! stopped while logged in sends `Logoff` and waits at most one read
//! timeout for the goodbye.

use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::{
    command::AmiAction,
    config::TrackerConfig,
    connection::{AmiConnection, ConnectionStatus, DisconnectReason},
    constants::STOP_JOIN_TIMEOUT,
    dispatcher::EventDispatcher,
    error::{AmiError, AmiResult},
    event::{AmiEvent, AmiEventType},
    presence::AgentState,
    protocol::MessageType,
    queue_stats::QueueStats,
    records::{AgentId, QueueId},
    sink::RecordSink,
};

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    config: Arc<TrackerConfig>,
    dispatcher: Arc<EventDispatcher>,
    worker: Mutex<Option<Worker>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl Supervisor {
    pub fn new(config: TrackerConfig, sink: Arc<dyn RecordSink>) -> AmiResult<Self> {
        config.validate()?;
        let dispatcher = Arc::new(EventDispatcher::new(sink, &config));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Stopped);
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            worker: Mutex::new(None),
            status_tx: Arc::new(status_tx),
            status_rx,
        })
    }

    /// Spawn the worker. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.as_ref() {
            if !worker.handle.is_finished() {
                debug!("Supervisor already running");
                return false;
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            self.config.clone(),
            self.dispatcher.clone(),
            shutdown_rx,
            self.status_tx.clone(),
        ));
        *slot = Some(Worker { shutdown, handle });
        info!("Supervisor started");
        true
    }

    /// Signal the worker and wait for it to exit. Returns `false` if it was
    /// not running.
    pub async fn stop(&self) -> bool {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut worker = match worker {
            Some(worker) => worker,
            None => return false,
        };

        let _ = worker.shutdown.send(true);
        match timeout(STOP_JOIN_TIMEOUT, &mut worker.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Supervisor worker failed: {}", e),
            Err(_) => {
                warn!(
                    "Supervisor worker did not stop within {:?}, aborting",
                    STOP_JOIN_TIMEOUT
                );
                worker.handle.abort();
            }
        }
        self.status_tx.send_replace(ConnectionStatus::Stopped);
        info!("Supervisor stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|worker| !worker.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub async fn agent_state(&self, agent: AgentId) -> Option<AgentState> {
        self.dispatcher.agent_state(agent).await
    }

    pub async fn queue_stats(&self, queue: QueueId) -> Option<QueueStats> {
        self.dispatcher.queue_stats(queue).await
    }

    pub async fn open_calls(&self) -> usize {
        self.dispatcher.open_calls().await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let slot = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.take() {
            debug!("Supervisor dropped while running, signalling worker");
            let _ = worker.shutdown.send(true);
        }
    }
}

/// Resolves once stop has been requested or the supervisor is gone
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

enum SessionEnd {
    Stopped,
    Failed(AmiError),
}

async fn run(
    config: Arc<TrackerConfig>,
    dispatcher: Arc<EventDispatcher>,
    mut shutdown: watch::Receiver<bool>,
    status: Arc<watch::Sender<ConnectionStatus>>,
) {
    let mut delay = config.reconnect_base;
    let mut last_sweep = Instant::now();

    loop {
        if stop_requested(&shutdown) {
            break;
        }
        status.send_replace(ConnectionStatus::Connecting);

        let connected = tokio::select! {
            biased;
            _ = wait_for_stop(&mut shutdown) => break,
            result = AmiConnection::connect(&config) => result,
        };

        let reason = match connected {
            Ok(mut connection) => {
                delay = config.reconnect_base;
                status.send_replace(ConnectionStatus::Connected);
                match session(
                    &mut connection,
                    &config,
                    &dispatcher,
                    &mut shutdown,
                    &mut last_sweep,
                )
                .await
                {
                    SessionEnd::Stopped => {
                        if let Err(e) = connection.logoff(config.read_timeout).await {
                            debug!("Logoff on stop failed: {}", e);
                        }
                        break;
                    }
                    SessionEnd::Failed(e) => {
                        warn!("AMI session ended: {}", e);
                        DisconnectReason::from(&e)
                    }
                }
            }
            Err(e) => {
                error!("AMI connect failed: {}", e);
                DisconnectReason::from(&e)
            }
        };
        status.send_replace(ConnectionStatus::Disconnected(reason));

        info!("Reconnecting in {}s", delay.as_secs_f32());
        tokio::select! {
            biased;
            _ = wait_for_stop(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = config.next_backoff(delay);
    }

    status.send_replace(ConnectionStatus::Stopped);
    debug!("Supervisor worker exiting");
}

enum Step {
    Stop,
    Keepalive,
    Read(Result<AmiResult<usize>, tokio::time::error::Elapsed>),
}

/// Read loop for one logged-in connection
async fn session<S>(
    connection: &mut AmiConnection<S>,
    config: &TrackerConfig,
    dispatcher: &EventDispatcher,
    shutdown: &mut watch::Receiver<bool>,
    last_sweep: &mut Instant,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Frames that arrived with the login response or in the last read
        while let Some(message) = connection.next_message() {
            if stop_requested(shutdown) {
                return SessionEnd::Stopped;
            }
            match message.message_type {
                MessageType::Event => {
                    let event = AmiEvent::from_headers(message.headers);
                    if *event.event_type() == AmiEventType::Shutdown {
                        let reason = event.header("Shutdown").unwrap_or("unknown").to_string();
                        return SessionEnd::Failed(AmiError::ServerShutdown { reason });
                    }
                    if let Err(e) = dispatcher.dispatch(&event).await {
                        if e.is_protocol_error() {
                            debug!("Dropped malformed {} event: {}", event.event_type(), e);
                        } else if e.is_recoverable() {
                            warn!("Dropped {} event: {}", event.event_type(), e);
                        } else {
                            return SessionEnd::Failed(e);
                        }
                    }
                }
                MessageType::Response => {
                    trace!(
                        "[RECV] Response: {}",
                        message.header("Response").unwrap_or("?")
                    );
                }
                MessageType::Other => {
                    debug!("[RECV] Ignoring frame without Event or Response");
                }
            }
        }

        if connection.last_inbound().elapsed() > config.liveness_timeout {
            return SessionEnd::Failed(AmiError::HeartbeatExpired {
                interval_ms: config.liveness_timeout.as_millis() as u64,
            });
        }
        housekeeping(config, dispatcher, last_sweep).await;

        let step = tokio::select! {
            biased;
            _ = wait_for_stop(shutdown) => Step::Stop,
            _ = keepalive.tick() => Step::Keepalive,
            read = timeout(config.read_timeout, connection.read_chunk()) => Step::Read(read),
        };

        match step {
            Step::Stop => return SessionEnd::Stopped,
            Step::Keepalive => {
                if let Err(e) = connection.send_action(&AmiAction::Ping).await {
                    return SessionEnd::Failed(e);
                }
            }
            Step::Read(Ok(Ok(_))) => {}
            Step::Read(Ok(Err(e))) if e.is_connection_error() => return SessionEnd::Failed(e),
            Step::Read(Ok(Err(e))) => warn!("Discarding unreadable input: {}", e),
            Step::Read(Err(_)) => trace!("[RECV] Read timed out, idle"),
        }
    }
}

/// Sweep expired correlation state and finish elapsed wrap-ups
async fn housekeeping(config: &TrackerConfig, dispatcher: &EventDispatcher, last_sweep: &mut Instant) {
    let now = Utc::now();
    if last_sweep.elapsed() >= config.sweep_interval {
        dispatcher.sweep(now).await;
        *last_sweep = Instant::now();
    }
    if let Err(e) = dispatcher.expire_wrapups(now).await {
        warn!("Wrap-up expiry write failed: {}", e);
    }
}
