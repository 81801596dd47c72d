//! JSON-lines output for ami-tracker

use ami_call_tracker::{
    AgentHistoryEntry, AgentId, AgentUpdate, CallRecord, MemorySink, QueueId, QueueRef,
    QueueStatsUpdate, RecordSink, SinkError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use tracing::warn;

/// One line on stdout
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Call {
        emitted_at: DateTime<Utc>,
        record: &'a CallRecord,
    },
    AgentHistory {
        emitted_at: DateTime<Utc>,
        entry: &'a AgentHistoryEntry,
    },
    Agent {
        emitted_at: DateTime<Utc>,
        update: &'a AgentUpdate,
    },
    QueueStats {
        emitted_at: DateTime<Utc>,
        update: &'a QueueStatsUpdate,
    },
}

/// Applies every write to a [`MemorySink`] and echoes it to stdout.
/// Only call records are printed unless `verbose` is set.
pub struct JsonLinesSink {
    inner: MemorySink,
    verbose: bool,
}

impl JsonLinesSink {
    pub fn new(inner: MemorySink, verbose: bool) -> Self {
        Self { inner, verbose }
    }

    pub fn inner(&self) -> &MemorySink {
        &self.inner
    }

    fn emit(&self, line: &Line<'_>) {
        let json = match serde_json::to_string(line) {
            Ok(json) => json,
            Err(e) => {
                warn!("Could not serialize output line: {}", e);
                return;
            }
        };
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", json).and_then(|_| out.flush()) {
            warn!("Could not write to stdout: {}", e);
        }
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn upsert_call(&self, record: &CallRecord) -> Result<(), SinkError> {
        self.inner.upsert_call(record).await?;
        self.emit(&Line::Call {
            emitted_at: Utc::now(),
            record,
        });
        Ok(())
    }

    async fn append_or_close_agent_history(
        &self,
        entry: &AgentHistoryEntry,
    ) -> Result<(), SinkError> {
        self.inner.append_or_close_agent_history(entry).await?;
        if self.verbose {
            self.emit(&Line::AgentHistory {
                emitted_at: Utc::now(),
                entry,
            });
        }
        Ok(())
    }

    async fn update_agent(&self, update: &AgentUpdate) -> Result<(), SinkError> {
        self.inner.update_agent(update).await?;
        if self.verbose {
            self.emit(&Line::Agent {
                emitted_at: Utc::now(),
                update,
            });
        }
        Ok(())
    }

    async fn upsert_queue_stats(&self, update: &QueueStatsUpdate) -> Result<(), SinkError> {
        self.inner.upsert_queue_stats(update).await?;
        if self.verbose {
            self.emit(&Line::QueueStats {
                emitted_at: Utc::now(),
                update,
            });
        }
        Ok(())
    }

    async fn record_member_call(
        &self,
        queue: QueueId,
        agent: AgentId,
        at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.inner.record_member_call(queue, agent, at).await
    }

    async fn find_agent_by_extension(
        &self,
        extension: &str,
    ) -> Result<Option<AgentId>, SinkError> {
        self.inner.find_agent_by_extension(extension).await
    }

    async fn find_queue_by_name(&self, name: &str) -> Result<Option<QueueRef>, SinkError> {
        self.inner.find_queue_by_name(name).await
    }
}
