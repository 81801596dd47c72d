//! Asterisk Manager Interface (AMI) call tracker for Rust
//!
//! This crate keeps one long-lived AMI session open to an Asterisk switch and
//! turns the event stream into durable contact-center records: one call
//! record per CDR, agent status history with time accumulators, and rolling
//! per-queue statistics.
//!
//! # Architecture
//!
//! - [`Supervisor`] owns the connection: login, keepalive, liveness and
//!   exponential-backoff reconnect. Start and stop are idempotent.
//! - [`EventDispatcher`] routes each event to its handler. Handlers update
//!   the [`CorrelationStore`], [`PresenceEngine`] and
//!   [`QueueStatsAggregator`] under one lock, then flush records.
//! - [`RecordSink`] is the persistence boundary. [`MemorySink`] is a
//!   complete in-process implementation.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ami_call_tracker::{AmiError, Directory, MemorySink, Supervisor, TrackerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let config = TrackerConfig::from_env()?;
//!     let sink = Arc::new(MemorySink::new(Directory::new()));
//!     let supervisor = Supervisor::new(config, sink.clone())?;
//!
//!     supervisor.start();
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.stop().await;
//!
//!     println!("{} calls recorded", sink.calls().await.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod presence;
pub mod queue_stats;
pub mod recording;
pub mod records;
pub mod sink;
pub mod supervisor;

pub(crate) mod buffer;
pub(crate) mod command;
pub(crate) mod constants;
pub(crate) mod handlers;
pub(crate) mod protocol;

pub use command::{ActionBuilder, AmiAction, AmiResponse};
pub use config::TrackerConfig;
pub use connection::{AmiConnection, ConnectionStatus, DisconnectReason};
pub use constants::DEFAULT_AMI_PORT;
pub use correlation::{CorrelationState, CorrelationStore, FinalStatus, Finalization, SweepStats};
pub use dispatcher::EventDispatcher;
pub use error::{AmiError, AmiResult};
pub use event::{extract_extension, parse_cdr_datetime, AmiEvent, AmiEventType};
pub use presence::{AgentState, AgentStatus, PresenceChange, PresenceEngine};
pub use protocol::{parse_headers, AmiMessage, AmiParser, MessageType};
pub use queue_stats::{QueueStats, QueueStatsAggregator};
pub use recording::RecordingLocator;
pub use records::{
    AgentCounters, AgentHistoryEntry, AgentId, AgentUpdate, CallDirection, CallRecord, CallStatus,
    QueueCounters, QueueGauges, QueueId, QueueRef, QueueStatsUpdate, RecordingRef,
};
pub use sink::{AgentRow, Directory, MemberCalls, MemorySink, QueueStatsRow, RecordSink, SinkError};
pub use supervisor::Supervisor;
