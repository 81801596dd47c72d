//! Tracker configuration.
//!
//! Values come from [`TrackerConfig::default`], the builder-style `with_*`
//! methods, the `ASTERISK_*` environment variables, or a JSON file. Durations
//! are written as whole seconds in serialized form.

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    constants::*,
    error::{AmiError, AmiResult},
};

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod utc_offset {
    use chrono::FixedOffset;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &FixedOffset, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FixedOffset, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_utc_offset(&raw)
            .ok_or_else(|| D::Error::custom(format!("not a UTC offset: {:?}", raw)))
    }
}

/// `+05:30`, `-0500`, `-05`, `Z` or `UTC`
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Connection, timing and housekeeping settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Comma-separated event classes sent in the `Events:` login header
    pub events: String,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub login_timeout: Duration,
    /// Upper bound on one blocking socket read; also bounds stop latency
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Tear the connection down after this long without any inbound bytes
    #[serde(with = "duration_secs")]
    pub liveness_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub reconnect_base: Duration,
    #[serde(with = "duration_secs")]
    pub reconnect_max: Duration,
    #[serde(with = "duration_secs")]
    pub correlation_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Directories scanned for call recordings named after the unique id
    pub recording_dirs: Vec<PathBuf>,
    pub min_recording_size: u64,
    /// UTC offset of the switch clock. CDR `StartTime`, `AnswerTime` and
    /// `EndTime` are local times at this offset.
    #[serde(with = "utc_offset")]
    pub cdr_utc_offset: FixedOffset,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            host: "asterisk".to_string(),
            port: DEFAULT_AMI_PORT,
            username: "admin".to_string(),
            secret: String::new(),
            events: DEFAULT_EVENT_CLASSES.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            liveness_timeout: DEFAULT_KEEPALIVE_INTERVAL * 3,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            correlation_ttl: DEFAULT_CORRELATION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            recording_dirs: DEFAULT_RECORDING_DIRS.iter().map(PathBuf::from).collect(),
            min_recording_size: DEFAULT_MIN_RECORDING_SIZE,
            cdr_utc_offset: Utc.fix(),
        }
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("events", &self.events)
            .field("connect_timeout", &self.connect_timeout)
            .field("login_timeout", &self.login_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("liveness_timeout", &self.liveness_timeout)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("correlation_ttl", &self.correlation_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("recording_dirs", &self.recording_dirs)
            .field("min_recording_size", &self.min_recording_size)
            .field("cdr_utc_offset", &self.cdr_utc_offset)
            .finish()
    }
}

impl TrackerConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Read `ASTERISK_HOST`, `ASTERISK_AMI_PORT`, `ASTERISK_AMI_USER`,
    /// `ASTERISK_AMI_PASSWORD`, `ASTERISK_AMI_EVENTS` and
    /// `ASTERISK_CDR_UTC_OFFSET` over the defaults.
    pub fn from_env() -> AmiResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AmiResult<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("ASTERISK_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("ASTERISK_AMI_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| AmiError::config(format!("ASTERISK_AMI_PORT is not a port: {}", port)))?;
        }
        if let Some(user) = lookup("ASTERISK_AMI_USER") {
            config.username = user;
        }
        if let Some(secret) = lookup("ASTERISK_AMI_PASSWORD") {
            config.secret = secret;
        }
        if let Some(events) = lookup("ASTERISK_AMI_EVENTS") {
            config.events = events;
        }
        if let Some(offset) = lookup("ASTERISK_CDR_UTC_OFFSET") {
            config.cdr_utc_offset = parse_utc_offset(&offset).ok_or_else(|| {
                AmiError::config(format!("ASTERISK_CDR_UTC_OFFSET is not a UTC offset: {}", offset))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON document; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> AmiResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> AmiResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> AmiResult<()> {
        if self.host.trim().is_empty() {
            return Err(AmiError::config("host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(AmiError::config("username must not be empty"));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("login_timeout", self.login_timeout),
            ("read_timeout", self.read_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("liveness_timeout", self.liveness_timeout),
            ("reconnect_base", self.reconnect_base),
            ("sweep_interval", self.sweep_interval),
            ("correlation_ttl", self.correlation_ttl),
        ] {
            if value.is_zero() {
                return Err(AmiError::config(format!("{} must be non-zero", name)));
            }
        }
        if self.reconnect_max < self.reconnect_base {
            return Err(AmiError::config(format!(
                "reconnect_max ({:?}) is below reconnect_base ({:?})",
                self.reconnect_max, self.reconnect_base
            )));
        }
        Ok(())
    }

    pub fn with_events(mut self, events: impl Into<String>) -> Self {
        self.events = events.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Also resets the liveness window to three keepalive intervals
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self.liveness_timeout = interval * 3;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    pub fn with_correlation_ttl(mut self, ttl: Duration) -> Self {
        self.correlation_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_recording_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.recording_dirs = dirs;
        self
    }

    pub fn with_cdr_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.cdr_utc_offset = offset;
        self
    }

    /// Next reconnect delay: doubled, capped at the ceiling
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.reconnect_max)
    }
}
