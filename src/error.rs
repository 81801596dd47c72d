//! Error types for AMI operations.
//!
//! All fallible operations in this crate return [`AmiResult<T>`].  Errors are
//! classified along the lines the read loop cares about:
//!
//! - **Connection errors** ([`AmiError::is_connection_error`]): the TCP session
//!   is dead or unusable and the supervisor should back off and reconnect.
//! - **Recoverable errors** ([`AmiError::is_recoverable`]): one frame could not
//!   be handled (missing header, sink write rejected) but the connection is
//!   fine and the loop keeps reading.

use crate::sink::SinkError;
use thiserror::Error;

/// Result type alias for AMI operations
pub type AmiResult<T> = Result<T, AmiError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AmiError {
    /// IO error from underlying TCP operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect or login handshake did not finish in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Login response lacked the success marker
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Protocol error - invalid frame or unexpected message
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    /// An event lacks a header its handler needs
    #[error("{event} event missing required header: {header}")]
    MissingHeader { event: String, header: String },

    /// Buffer overflow - no frame delimiter within the size limit
    #[error("Buffer overflow: {size} bytes buffered exceeds limit {limit}")]
    BufferOverflow { size: usize, limit: usize },

    /// Connection closed by remote
    #[error("Connection closed by Asterisk")]
    ConnectionClosed,

    /// No inbound traffic (events or Ping replies) within the liveness window
    #[error("No traffic for {interval_ms}ms, connection presumed dead")]
    HeartbeatExpired { interval_ms: u64 },

    /// The switch announced it is shutting down
    #[error("Asterisk is shutting down: {reason}")]
    ServerShutdown { reason: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Record sink rejected a read or write
    #[error("Record sink error: {0}")]
    Sink(#[from] SinkError),
}

impl AmiError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn missing_header(event: impl Into<String>, header: impl Into<String>) -> Self {
        Self::MissingHeader {
            event: event.into(),
            header: header.into(),
        }
    }

    /// `true` if only the current frame is affected and the read loop continues.
    ///
    /// Recoverable: `ProtocolError`, `MissingHeader`, `Sink`,
    /// `JsonError`. Everything touching the socket is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AmiError::ProtocolError { .. } => true,
            AmiError::MissingHeader { .. } => true,
            AmiError::Sink(_) => true,
            AmiError::JsonError(_) => true,
            _ => false,
        }
    }

    /// `true` if the TCP session is dead and the supervisor should reconnect.
    ///
    /// Matches: `Io`, `Timeout`, `AuthenticationFailed`,
    /// `ConnectionClosed`, `HeartbeatExpired`, `ServerShutdown`, `BufferOverflow`.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::Timeout { .. }
                | AmiError::AuthenticationFailed { .. }
                | AmiError::ConnectionClosed
                | AmiError::HeartbeatExpired { .. }
                | AmiError::ServerShutdown { .. }
                | AmiError::BufferOverflow { .. }
        )
    }

    /// `true` for malformed or incomplete frames, which are logged and dropped.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            AmiError::ProtocolError { .. } | AmiError::MissingHeader { .. }
        )
    }
}
