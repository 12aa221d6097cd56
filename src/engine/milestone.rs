//! Milestone timestamp sub-dispatch: an index-correlated second stage fed by
//! successful primary items.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::api::{OperationKind, PartnerApi};
use crate::domain::batch::Batch;
use crate::domain::item::MilestoneResult;
use crate::error::Result;
use crate::log::{LogSink, LogStatus, TimelineEntry};
use crate::store::BatchStore;

use super::dispatch::{DispatchJob, DispatchOutcome, Dispatcher};
use super::reduce::MilestoneTarget;

const SKIPPED_MESSAGE: &str =
    "Skipped Timestamp API call as no corresponding shipment_id was found.";

/// Correlation data carried alongside each flattened milestone job.
struct JobMeta {
    parent: usize,
    milestone: Value,
    shipment_id: Option<String>,
}

/// Run the milestone stage: up to `rounds_cap` rounds over the flattened
/// `(item, milestone)` pairs, stopping early on a clean round. The final
/// round runs without a retry announcement.
pub(super) async fn run<S, A, L>(
    dispatcher: &Dispatcher,
    api: Arc<A>,
    store: &S,
    log: &L,
    batch: &mut Batch,
    targets: &[MilestoneTarget],
    rounds_cap: u32,
) -> Result<()>
where
    S: BatchStore,
    A: PartnerApi + 'static,
    L: LogSink,
{
    log.record(TimelineEntry::new(
        batch.id,
        "Initializing Timestamp API call",
        LogStatus::InProgress,
    ));

    for round in 0..=rounds_cap {
        let retry_applicable = round < rounds_cap;
        let failed = run_round(dispatcher, api.clone(), store, log, batch, targets, retry_applicable)
            .await?;

        if failed == 0 {
            break;
        }
    }

    Ok(())
}

/// One milestone round. Returns the failed-call count.
async fn run_round<S, A, L>(
    dispatcher: &Dispatcher,
    api: Arc<A>,
    store: &S,
    log: &L,
    batch: &mut Batch,
    targets: &[MilestoneTarget],
    retry_applicable: bool,
) -> Result<usize>
where
    S: BatchStore,
    A: PartnerApi + 'static,
    L: LogSink,
{
    let mut jobs = Vec::new();
    let mut metas = Vec::new();

    for (parent, target) in targets.iter().enumerate() {
        if target.milestones.is_empty() {
            continue;
        }

        let parent_record = batch.response_at(parent);
        let parent_status = parent_record.and_then(|r| r.status_code);

        for (milestone_index, milestone) in target.milestones.iter().enumerate() {
            let index = jobs.len();
            metas.push(JobMeta {
                parent,
                milestone: milestone.clone(),
                shipment_id: target.shipment_id.clone(),
            });

            // A parent that never reached 200 fails its milestones without a
            // network call.
            if parent_status != Some(200) {
                jobs.push(DispatchJob::Resolved {
                    index,
                    parent_index: Some(parent),
                    body: json!({}),
                    status: None,
                });
                continue;
            }

            let cached = parent_record.and_then(|r| r.timestamp_responses.get(milestone_index));
            jobs.push(DispatchJob::Call {
                index,
                parent_index: Some(parent),
                operation: OperationKind::Timestamp,
                request_data: json!({
                    "milestone": milestone,
                    "shipment_id": target.shipment_id,
                }),
                cached_body: cached.map(|r| r.response_content.clone()).unwrap_or(Value::Null),
                cached_status: cached.and_then(|r| r.status_code),
            });
        }
    }

    let total = jobs.len();
    if total == 0 {
        return Ok(0);
    }

    let outcomes = dispatcher.execute(api, jobs).await;
    let failed = reduce_round(batch, outcomes, &metas);

    store.update_responses(batch.id, &batch.responses).await?;

    if failed != total {
        let sub_message = if failed > 0 { "partially successful" } else { "successful" };
        log.record(TimelineEntry::new(
            batch.id,
            format!("Time Stamp API call was {sub_message} ({}/{total})", total - failed),
            LogStatus::InProgress,
        ));
    }

    if failed > 0 {
        let sub_message = if failed != total { "partially failed" } else { "failed" };
        let retry_message = if retry_applicable { ". Attempting to retry" } else { "" };
        log.record(TimelineEntry::new(
            batch.id,
            format!("Time Stamp API call was {sub_message}{retry_message} ({failed}/{total})"),
            LogStatus::Warning,
        ));
    }

    Ok(failed)
}

/// Merge one round of milestone outcomes under their parents. Each round
/// rebuilds every parent's milestone list in flatten order, so alignment is
/// preserved across rounds.
fn reduce_round(batch: &mut Batch, outcomes: Vec<DispatchOutcome>, metas: &[JobMeta]) -> usize {
    let mut failed = 0;

    for record in &mut batch.responses {
        record.timestamp_responses.clear();
    }

    for (outcome, meta) in outcomes.into_iter().zip(metas) {
        if meta.parent >= batch.responses.len() {
            failed += 1;
            tracing::error!(
                batch_id = %batch.id,
                parent = meta.parent,
                "Dropped milestone result without a stored parent record"
            );
            continue;
        }

        let response_content = if outcome.body == json!({}) {
            Value::String(SKIPPED_MESSAGE.to_string())
        } else {
            outcome.body
        };

        batch.responses[meta.parent]
            .timestamp_responses
            .push(MilestoneResult {
                status_code: outcome.status,
                response_content,
                milestone: meta.milestone.clone(),
                shipment_id: meta.shipment_id.clone(),
            });

        if outcome.status != Some(200) {
            failed += 1;
        }
    }

    failed
}
