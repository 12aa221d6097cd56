//! User-facing timeline logging.
//!
//! The timeline is the audit trail operations staff read; its messages carry
//! per-item counts and retry announcements and must stay stable. Structured
//! tracing output is emitted alongside, not instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::batch::BatchId;

/// Severity of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    InProgress,
    Warning,
    Failed,
}

/// One entry in the batch's user-facing timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub batch_id: BatchId,
    pub message: String,
    pub status: LogStatus,
    /// Free-form detail shown when the user expands the entry, typically the
    /// partner's response body.
    pub remarks: Option<String>,
    /// Short label for the pipeline stage that produced the entry.
    pub action: Option<String>,
    pub at: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(batch_id: BatchId, message: impl Into<String>, status: LogStatus) -> Self {
        Self {
            batch_id,
            message: message.into(),
            status,
            remarks: None,
            action: None,
            at: Utc::now(),
        }
    }

    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = Some(remarks.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Destination for timeline entries.
///
/// Recording is synchronous and infallible from the engine's point of view;
/// a sink that persists remotely should buffer internally.
pub trait LogSink: Send + Sync {
    fn record(&self, entry: TimelineEntry);
}

/// Sink that forwards timeline entries to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, entry: TimelineEntry) {
        match entry.status {
            LogStatus::InProgress => tracing::info!(
                batch_id = %entry.batch_id,
                remarks = entry.remarks.as_deref().unwrap_or(""),
                "{}",
                entry.message
            ),
            LogStatus::Warning => tracing::warn!(
                batch_id = %entry.batch_id,
                remarks = entry.remarks.as_deref().unwrap_or(""),
                "{}",
                entry.message
            ),
            LogStatus::Failed => tracing::error!(
                batch_id = %entry.batch_id,
                remarks = entry.remarks.as_deref().unwrap_or(""),
                "{}",
                entry.message
            ),
        }
    }
}

/// In-memory sink for tests: collects entries for later assertion.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: parking_lot::Mutex<Vec<TimelineEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries.lock().clone()
    }

    /// Messages only, in recording order.
    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.message.clone()).collect()
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, entry: TimelineEntry) {
        self.entries.lock().push(entry);
    }
}
