//! Retry budget accounting and round-outcome logging.

use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::domain::batch::BatchId;
use crate::log::{LogSink, LogStatus, TimelineEntry};

/// Retry configuration injected into the engine. Defaults disable retrying
/// entirely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry rounds before the engine gives up.
    pub max_retry: u32,
    /// Backoff interval announced to the timeline; the caller schedules the
    /// actual re-invocation.
    pub retry_interval_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 0,
            retry_interval_secs: 0,
        }
    }
}

/// Settle a dispatch round: write the 4-way classification to the timeline
/// and update the retry counter.
///
/// `retry_count` is bumped while a retryable failure persists and the budget
/// allows another round; the instant a round fully succeeds or the budget is
/// exhausted it resets to 0. Returns the updated `is_retrying` signal.
pub fn settle_round(
    log: &dyn LogSink,
    batch_id: BatchId,
    label: &str,
    total: usize,
    failed: usize,
    retry_count: &mut u32,
    mut is_retrying: bool,
    policy: &RetryPolicy,
) -> bool {
    if total != failed {
        let sub_message = if failed > 0 {
            "partially successful"
        } else {
            *retry_count = 0;
            is_retrying = false;
            "successful"
        };

        log.record(TimelineEntry::new(
            batch_id,
            format!("{label} was {sub_message} ({}/{total})", total - failed),
            LogStatus::InProgress,
        ));
    }

    if failed > 0 {
        let sub_message = if total != failed { "partially failed" } else { "failed" };
        let mut message = format!("{label} was {sub_message} ({failed}/{total})");

        if is_retrying && *retry_count < policy.max_retry {
            *retry_count += 1;
            counter!("consign_retry_rounds_total").increment(1);
            message.push_str(&format!(
                ". Retrying in {} seconds",
                policy.retry_interval_secs
            ));
        } else {
            *retry_count = 0;
            is_retrying = false;
        }

        log.record(TimelineEntry::new(batch_id, message, LogStatus::Warning));
    }

    is_retrying
}

/// Per-call retry check for the sequential path. A non-(200|400) status with
/// budget remaining announces the retry and raises the signal; the caller
/// owns the counter bump.
pub fn check_retry(
    log: &dyn LogSink,
    batch_id: BatchId,
    label: &str,
    status: Option<u16>,
    body_remarks: String,
    retry_count: u32,
    is_retrying: bool,
    policy: &RetryPolicy,
) -> bool {
    if retry_count < policy.max_retry && !matches!(status, Some(200) | Some(400)) {
        log.record(
            TimelineEntry::new(
                batch_id,
                format!(
                    "{label} API call was failed with status {}. Retrying in {} seconds",
                    status_label(status),
                    policy.retry_interval_secs
                ),
                LogStatus::Warning,
            )
            .with_remarks(body_remarks),
        );
        return true;
    }

    is_retrying
}

fn status_label(status: Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}
