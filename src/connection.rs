//! Connection management for AMI

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    command::AmiAction,
    config::TrackerConfig,
    constants::*,
    error::{AmiError, AmiResult},
    protocol::{AmiMessage, AmiParser, MessageType},
};

/// Connection status as published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// TCP connect or login in progress
    Connecting,
    /// Logged in and reading events
    Connected,
    /// Between attempts, waiting out the backoff
    Disconnected(DisconnectReason),
    /// Supervisor is not running
    Stopped,
}

/// Why the last session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the socket
    ConnectionClosed,
    /// Nothing received within the liveness window
    HeartbeatExpired,
    /// Login rejected
    AuthenticationFailed,
    /// Switch announced shutdown
    ServerShutdown,
    /// Connect or login did not finish in time
    Timeout,
    /// Socket error
    IoError(String),
    /// Stream could not be framed
    Protocol(String),
}

impl From<&AmiError> for DisconnectReason {
    fn from(err: &AmiError) -> Self {
        match err {
            AmiError::ConnectionClosed => DisconnectReason::ConnectionClosed,
            AmiError::HeartbeatExpired { .. } => DisconnectReason::HeartbeatExpired,
            AmiError::AuthenticationFailed { .. } => DisconnectReason::AuthenticationFailed,
            AmiError::ServerShutdown { .. } => DisconnectReason::ServerShutdown,
            AmiError::Timeout { .. } => DisconnectReason::Timeout,
            AmiError::Io(e) => DisconnectReason::IoError(e.to_string()),
            other => DisconnectReason::Protocol(other.to_string()),
        }
    }
}

/// One logged-in AMI session
pub struct AmiConnection<S = TcpStream> {
    /// Byte stream, normally TCP
    stream: S,
    /// Protocol parser
    parser: AmiParser,
    /// Socket read buffer
    read_buffer: Box<[u8]>,
    /// Authentication state
    authenticated: bool,
    /// Greeting line sent by the switch
    banner: Option<String>,
    /// Last time any bytes arrived
    last_inbound: Instant,
}

impl AmiConnection<TcpStream> {
    /// Connect and log in, each step bounded by its configured timeout
    pub async fn connect(config: &TrackerConfig) -> AmiResult<Self> {
        info!("Connecting to Asterisk AMI at {}:{}", config.host, config.port);

        debug!(
            "[CONNECT] Starting TCP connect with {}ms timeout",
            config.connect_timeout.as_millis()
        );
        let tcp_result = timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await;

        let stream = match tcp_result {
            Ok(Ok(s)) => {
                debug!("[CONNECT] TCP connection established");
                s
            }
            Ok(Err(e)) => {
                warn!("[CONNECT] TCP connect failed: {}", e);
                return Err(AmiError::Io(e));
            }
            Err(_) => {
                warn!(
                    "[CONNECT] TCP connect timed out after {}ms",
                    config.connect_timeout.as_millis()
                );
                return Err(timeout_error(config.connect_timeout));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[CONNECT] Could not set TCP_NODELAY: {}", e);
        }

        let mut connection = Self::from_stream(stream);
        match timeout(
            config.login_timeout,
            connection.login(&config.username, &config.secret, &config.events),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "[AUTH] Login timed out after {}ms",
                    config.login_timeout.as_millis()
                );
                return Err(timeout_error(config.login_timeout));
            }
        }

        info!(
            "Successfully connected and logged in to Asterisk as {}",
            config.username
        );
        Ok(connection)
    }
}

impl<S> AmiConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-open stream. Nothing is read or written yet.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            parser: AmiParser::new(),
            read_buffer: vec![0u8; SOCKET_BUF_SIZE].into_boxed_slice(),
            authenticated: false,
            banner: None,
            last_inbound: Instant::now(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Last time bytes arrived on the socket
    pub fn last_inbound(&self) -> Instant {
        self.last_inbound
    }

    /// Read the greeting, send `Login` and wait for its response
    pub async fn login(&mut self, username: &str, secret: &str, events: &str) -> AmiResult<()> {
        debug!("[AUTH] Waiting for banner");
        let banner = loop {
            if let Some(banner) = self.parser.read_banner() {
                break banner;
            }
            self.read_chunk().await?;
        };
        debug!("[AUTH] Banner: {}", banner);
        self.banner = Some(banner);

        debug!("[AUTH] Sending Login for {}", username);
        self.send_action(&AmiAction::Login {
            username: username.to_string(),
            secret: secret.to_string(),
            events: events.to_string(),
        })
        .await?;

        let response = loop {
            let message = self.recv_message().await?;
            match message.message_type {
                MessageType::Response => break message.into_response(),
                _ => {
                    debug!(
                        "[AUTH] Ignoring {:?} message while waiting for login response",
                        message.message_type
                    );
                }
            }
        };
        debug!(
            "[AUTH] Received login response: success={}",
            response.is_success()
        );

        if !response.is_success() {
            return Err(AmiError::auth_failed(
                response.message().unwrap_or("Authentication failed"),
            ));
        }

        self.authenticated = true;
        debug!("Authentication successful");
        Ok(())
    }

    /// Send `Logoff` and wait up to `limit` for the goodbye. Events still in
    /// flight are discarded.
    pub async fn logoff(&mut self, limit: Duration) -> AmiResult<()> {
        self.send_action(&AmiAction::Logoff).await?;
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_message_timeout(remaining).await? {
                Some(message) if message.message_type == MessageType::Response => {
                    message.into_response().into_result()?;
                    self.authenticated = false;
                    debug!("[AUTH] Logged off");
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(timeout_error(limit)),
            }
        }
    }

    /// Write one action. Does not wait for the response; replies arrive
    /// interleaved with events and are read by [`Self::recv_message`].
    pub async fn send_action(&mut self, action: &AmiAction) -> AmiResult<()> {
        trace!("[SEND] {}", action.name());
        let wire = action.to_wire_format();
        self.stream
            .write_all(wire.as_bytes())
            .await
            .map_err(AmiError::Io)?;
        self.stream.flush().await.map_err(AmiError::Io)?;
        Ok(())
    }

    /// One socket read into the parser. Cancel-safe.
    pub async fn read_chunk(&mut self) -> AmiResult<usize> {
        let bytes_read = self
            .stream
            .read(&mut self.read_buffer)
            .await
            .map_err(AmiError::Io)?;

        trace!("[RECV] Read {} bytes from socket", bytes_read);
        if bytes_read == 0 {
            return Err(AmiError::ConnectionClosed);
        }
        self.last_inbound = Instant::now();
        self.parser.add_data(&self.read_buffer[..bytes_read])?;
        Ok(bytes_read)
    }

    /// Next complete frame already buffered, without touching the socket
    pub fn next_message(&mut self) -> Option<AmiMessage> {
        self.parser.next_message()
    }

    /// Receive a protocol message, reading as needed
    pub async fn recv_message(&mut self) -> AmiResult<AmiMessage> {
        loop {
            if let Some(message) = self.parser.next_message() {
                trace!(
                    "[RECV] Parsed message from buffer: {:?}",
                    message.message_type
                );
                return Ok(message);
            }
            self.read_chunk().await?;
        }
    }

    /// Receive with a bound; `None` when nothing complete arrived in time
    pub async fn recv_message_timeout(&mut self, limit: Duration) -> AmiResult<Option<AmiMessage>> {
        match timeout(limit, self.recv_message()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

fn timeout_error(limit: Duration) -> AmiError {
    AmiError::Timeout {
        timeout_ms: limit.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const BANNER: &[u8] = b"Asterisk Call Manager/5.0.1\r\n";
    const LOGIN: &[u8] = b"Action: Login\r\nUsername: admin\r\nSecret: pw\r\nEvents: cdr,call,agent\r\n\r\n";

    #[tokio::test]
    async fn test_login_success() {
        let stream = Builder::new()
            .read(BANNER)
            .write(LOGIN)
            .read(b"Response: Success\r\nMessage: Authentication accepted\r\n\r\n")
            .build();

        let mut conn = AmiConnection::from_stream(stream);
        conn.login("admin", "pw", DEFAULT_EVENT_CLASSES).await.unwrap();
        assert!(conn.is_authenticated());
        assert_eq!(conn.banner(), Some("Asterisk Call Manager/5.0.1"));
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let stream = Builder::new()
            .read(BANNER)
            .write(LOGIN)
            .read(b"Response: Error\r\nMessage: Authentication failed\r\n\r\n")
            .build();

        let mut conn = AmiConnection::from_stream(stream);
        match conn.login("admin", "pw", DEFAULT_EVENT_CLASSES).await {
            Err(AmiError::AuthenticationFailed { reason }) => {
                assert_eq!(reason, "Authentication failed")
            }
            other => panic!("Expected AuthenticationFailed, got: {:?}", other),
        }
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_banner_and_response_in_one_read() {
        let stream = Builder::new()
            .read(BANNER)
            .write(LOGIN)
            .read(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\nResponse: Success\r\n\r\nEvent: Hold\r\nUniqueid: 1.1\r\n\r\n")
            .build();

        let mut conn = AmiConnection::from_stream(stream);
        conn.login("admin", "pw", DEFAULT_EVENT_CLASSES).await.unwrap();

        let event = conn.next_message().unwrap().into_event().unwrap();
        assert_eq!(event.call_id(), Some("1.1"));
        assert!(conn.next_message().is_none());
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let stream = Builder::new().read(b"Event: Hold\r\n").build();
        let mut conn = AmiConnection::from_stream(stream);
        match conn.recv_message().await {
            Err(AmiError::ConnectionClosed) => {}
            other => panic!("Expected ConnectionClosed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_wire() {
        let stream = Builder::new().write(b"Action: Ping\r\n\r\n").build();
        let mut conn = AmiConnection::from_stream(stream);
        conn.send_action(&AmiAction::Ping).await.unwrap();
    }

    #[tokio::test]
    async fn test_logoff_skips_trailing_events() {
        let stream = Builder::new()
            .write(b"Action: Logoff\r\n\r\n")
            .read(b"Event: Hold\r\nUniqueid: 1.1\r\n\r\nResponse: Goodbye\r\nMessage: Thanks for all the fish.\r\n\r\n")
            .build();

        let mut conn = AmiConnection::from_stream(stream);
        conn.logoff(Duration::from_secs(1)).await.unwrap();
        assert!(!conn.is_authenticated());
        assert!(conn.next_message().is_none());
    }

    #[tokio::test]
    async fn test_logoff_times_out_without_reply() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut conn = AmiConnection::from_stream(client);
        match conn.logoff(Duration::from_millis(50)).await {
            Err(AmiError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 50),
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            DisconnectReason::from(&AmiError::ConnectionClosed),
            DisconnectReason::ConnectionClosed
        );
        assert_eq!(
            DisconnectReason::from(&AmiError::HeartbeatExpired { interval_ms: 1 }),
            DisconnectReason::HeartbeatExpired
        );
        assert_eq!(
            DisconnectReason::from(&AmiError::auth_failed("x")),
            DisconnectReason::AuthenticationFailed
        );
    }
}
