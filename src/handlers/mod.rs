//! Per-event handlers.
//!
//! Handlers resolve references through the sink first, then take the state
//! lock once, mutate, and return the writes for the dispatcher to flush.

pub(crate) mod agent;
pub(crate) mod cdr;
pub(crate) mod channel;
pub(crate) mod queue;

use chrono::{DateTime, Utc};

/// Whole seconds from `from` to `to`, floored at zero
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_seconds().max(0) as u64
}
