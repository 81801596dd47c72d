//! Protocol constants and configuration defaults

use std::time::Duration;

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket read size per `read()` call
pub const SOCKET_BUF_SIZE: usize = 16 * 1024;

/// Buffer allocation size - used for both initial allocation and growth increments
pub const BUF_CHUNK: usize = 16 * 1024;

/// Maximum total buffer size (4MB). AMI frames are a few hundred bytes; hitting
/// this means the peer is not speaking AMI or a delimiter was lost.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Frame terminators. The switch sends CRLF; bare LF is accepted for
/// proxies and test tools that normalise line endings.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const LF_FRAME_TERMINATOR: &[u8] = b"\n\n";
pub const LINE_TERMINATOR: &str = "\r\n";

/// Header names
pub const HEADER_ACTION: &str = "Action";
pub const HEADER_EVENT: &str = "Event";
pub const HEADER_RESPONSE: &str = "Response";
pub const HEADER_MESSAGE: &str = "Message";
pub const HEADER_TIMESTAMP: &str = "Timestamp";

/// Header names carrying the switch-assigned call identifier, in lookup order
pub const CALL_ID_HEADERS: &[&str] = &["Uniqueid", "UniqueID", "UniqueId"];

/// Response values
pub const RESPONSE_SUCCESS: &str = "Success";
pub const RESPONSE_GOODBYE: &str = "Goodbye";

/// Prefix applied to the switch unique id to form the durable call id
pub const CALL_ID_PREFIX: &str = "ast-";

/// Default event classes requested at login
pub const DEFAULT_EVENT_CLASSES: &str = "cdr,call,agent";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(60);
pub const DEFAULT_CORRELATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How long `stop()` waits for the worker to release the socket
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Recording files at or below this size are header-only and ignored
pub const DEFAULT_MIN_RECORDING_SIZE: u64 = 100;
pub const DEFAULT_RECORDING_DIRS: &[&str] = &["/var/spool/asterisk/monitor", "/app/recordings"];
