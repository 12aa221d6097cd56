//! The submission engine: dispatch, reduction, retry, milestones, uploads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::api::{OperationKind, PartnerApi};
use crate::domain::batch::Batch;
use crate::domain::item::{MilestoneResult, RequestType};
use crate::domain::profile::Profile;
use crate::error::{ConsignError, Result};
use crate::log::{LogSink, LogStatus, TimelineEntry};
use crate::store::BatchStore;

pub mod dispatch;
pub mod milestone;
pub mod outcome;
pub mod payload;
pub mod reduce;
pub mod retry;
pub mod upload;

use dispatch::{DispatchJob, Dispatcher, call_single};
use reduce::MilestoneTarget;
use retry::{RetryPolicy, check_retry, settle_round};
use upload::{UploadOutcome, UploadStage};

/// Engine configuration. Retry behavior is injected, never read from
/// globals.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Concurrent dispatch slots per round.
    pub workers: usize,
    /// Per-call budget; a timed-out call yields a retryable synthetic status.
    pub call_timeout_ms: u64,
    /// Round cap for the milestone timestamp stage.
    pub timestamp_rounds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: 30,
            call_timeout_ms: 300_000,
            timestamp_rounds: 3,
        }
    }
}

/// What one `submit` round reports back to the scheduling caller.
///
/// `all_passed` is true when any item in the round succeeded; `is_retrying`
/// asks the caller to re-invoke `submit` after the configured interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    pub all_passed: bool,
    pub is_retrying: bool,
}

/// Drives a batch through dispatch, reduction, retry accounting, milestone
/// sub-dispatch and document upload. Generic over the partner client, the
/// store and the timeline sink so every stage is testable in isolation.
pub struct SubmissionEngine<S, A, L> {
    store: Arc<S>,
    api: Arc<A>,
    log: Arc<L>,
    config: EngineConfig,
    dispatcher: Dispatcher,
}

impl<S, A, L> SubmissionEngine<S, A, L>
where
    S: BatchStore,
    A: PartnerApi + 'static,
    L: LogSink,
{
    pub fn new(store: Arc<S>, api: Arc<A>, log: Arc<L>, config: EngineConfig) -> Self {
        let dispatcher = Dispatcher::new(config.workers, Duration::from_millis(config.call_timeout_ms));
        Self {
            store,
            api,
            log,
            config,
            dispatcher,
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    /// Drive one full submission round over the batch.
    ///
    /// Idempotent: an index whose stored record is already 200 is never
    /// re-dispatched, so re-invoking after a partial failure only touches
    /// the not-yet-successful items. The caller re-invokes on a schedule
    /// while `is_retrying` is true.
    pub async fn submit(&self, batch: &mut Batch, profile: &Profile) -> Result<RoundOutcome> {
        if batch.items.is_empty() {
            return Ok(RoundOutcome {
                all_passed: false,
                is_retrying: false,
            });
        }

        if batch.is_fan_out {
            self.submit_fan_out(batch, profile).await
        } else {
            self.submit_sequential(batch, profile).await
        }
    }

    /// Upload the documents attached to the batch's items, then the
    /// additional unassigned documents once everything else is settled.
    pub async fn upload_documents(
        &self,
        batch: &mut Batch,
        profile: &Profile,
    ) -> Result<UploadOutcome> {
        let stage = UploadStage {
            dispatcher: &self.dispatcher,
            store: self.store.as_ref(),
            log: self.log.as_ref(),
            policy: &self.config.retry,
            call_timeout: self.call_timeout(),
        };
        stage.run(self.api.clone(), batch, profile).await
    }

    /// Consolidated report for a finished batch.
    pub fn build_outcome_context(
        &self,
        batch: &Batch,
        upload: &UploadOutcome,
        failed_api_call_count: usize,
    ) -> (Value, String) {
        outcome::build_outcome_context(batch, upload, failed_api_call_count)
    }

    // ------------------------------------------------------------------
    // Fan-out mode
    // ------------------------------------------------------------------

    async fn submit_fan_out(&self, batch: &mut Batch, profile: &Profile) -> Result<RoundOutcome> {
        let mut identifiers = Vec::with_capacity(batch.items.len());
        let mut milestone_targets = Vec::with_capacity(batch.items.len());
        let mut jobs = Vec::with_capacity(batch.items.len());

        for (index, item) in batch.items.iter().enumerate() {
            let prepared = payload::prepare(item, batch, profile.send_timestamps);
            identifiers.push(prepared.identifier);
            milestone_targets.push(MilestoneTarget {
                milestones: prepared.milestones,
                shipment_id: None,
            });

            let record = batch.response_at(index);
            let cached_body = record.map(|r| r.body.clone()).unwrap_or(json!({}));
            let cached_status = record.and_then(|r| r.status_code);

            // Two-state protocol: once a create handed back a statusURL, the
            // index polls instead of re-creating.
            let (operation, request_data) = match batch.poll_url(index) {
                Some(url) => {
                    let mut poll_payload = cached_body.clone();
                    if let Some(map) = poll_payload.as_object_mut() {
                        map.insert("statusURL".to_string(), Value::String(url.to_owned()));
                    }
                    (OperationKind::Poll, poll_payload)
                }
                None => (OperationKind::Submit(item.request_type), prepared.payload),
            };

            jobs.push(DispatchJob::Call {
                index,
                parent_index: None,
                operation,
                request_data,
                cached_body,
                cached_status,
            });
        }

        let label = format!("{} API call", title_label(batch.items[0].request_type));
        let total = jobs.len();

        if batch.retry_count == 0 {
            self.log.record(
                TimelineEntry::new(
                    batch.id,
                    format!(
                        "Calling {} API to send payload ({total})",
                        title_label(batch.items[0].request_type)
                    ),
                    LogStatus::InProgress,
                )
                .with_action("display_paginated_json"),
            );
        }

        let outcomes = self.dispatcher.execute(self.api.clone(), jobs).await;

        let stats =
            reduce::reduce_submit_round(batch, outcomes, &identifiers, &mut milestone_targets);

        batch.confirmation_numbers = stats.confirmations.clone();
        self.store.update_responses(batch.id, &batch.responses).await?;
        self.store
            .update_status_poll_urls(batch.id, &batch.status_poll_urls)
            .await?;
        self.store
            .update_confirmations(batch.id, &batch.confirmation_numbers)
            .await?;

        let mut retry_count = batch.retry_count;
        let is_retrying = settle_round(
            self.log.as_ref(),
            batch.id,
            &label,
            total,
            stats.failed_count,
            &mut retry_count,
            stats.is_retrying,
            &self.config.retry,
        );
        batch.retry_count = retry_count;
        self.store.update_retry_count(batch.id, retry_count).await?;

        if stats.all_passed
            && profile.send_timestamps
            && milestone_targets.iter().any(|t| !t.milestones.is_empty())
        {
            milestone::run(
                &self.dispatcher,
                self.api.clone(),
                self.store.as_ref(),
                self.log.as_ref(),
                batch,
                &milestone_targets,
                self.config.timestamp_rounds,
            )
            .await?;
        }

        Ok(RoundOutcome {
            all_passed: stats.all_passed,
            is_retrying,
        })
    }

    // ------------------------------------------------------------------
    // Sequential mode
    // ------------------------------------------------------------------

    async fn submit_sequential(
        &self,
        batch: &mut Batch,
        profile: &Profile,
    ) -> Result<RoundOutcome> {
        let mut all_passed = true;
        let mut is_retrying = false;
        let mut confirmations = Vec::new();

        for index in 0..batch.items.len() {
            let item = batch.items[index].clone();
            let cached = batch.response_at(index).cloned();
            let prepared = payload::prepare(&item, batch, profile.send_timestamps);
            let cached_200 = cached.as_ref().is_some_and(|r| r.succeeded());

            // A settled non-create item is done for good; creates re-enter so
            // their cached body can feed the timestamp stage.
            if cached_200 && item.request_type != RequestType::ShipmentCreate {
                continue;
            }

            if batch.retry_count == 0 {
                self.log.record(
                    TimelineEntry::new(
                        batch.id,
                        format!("Calling {} API to send payload", item.request_type),
                        LogStatus::InProgress,
                    )
                    .with_remarks(prepared.payload.to_string())
                    .with_action("display_json"),
                );
            }

            let (body, status) = self
                .sequential_call(batch, index, &item, &prepared, cached.as_ref())
                .await?;

            is_retrying = check_retry(
                self.log.as_ref(),
                batch.id,
                &title_label(item.request_type),
                status,
                body.to_string(),
                batch.retry_count,
                is_retrying,
                &self.config.retry,
            );

            if !(is_retrying || cached_200) {
                if status == Some(200) {
                    batch.retry_count = 0;
                    self.store.update_retry_count(batch.id, 0).await?;

                    self.log.record(
                        TimelineEntry::new(
                            batch.id,
                            format!("{} API call was successful", title_label(item.request_type)),
                            LogStatus::InProgress,
                        )
                        .with_remarks(body.to_string())
                        .with_action("display_json"),
                    );
                } else {
                    all_passed = false;
                    batch.record_response(index, status, body.clone())?;
                    self.store.update_responses(batch.id, &batch.responses).await?;

                    self.log.record(
                        TimelineEntry::new(
                            batch.id,
                            format!(
                                "{} API call was failed with status {}",
                                title_label(item.request_type),
                                status.map_or_else(|| "unknown".to_string(), |s| s.to_string())
                            ),
                            LogStatus::Warning,
                        )
                        .with_remarks(body.to_string())
                        .with_action("display_json"),
                    );

                    break;
                }
            }

            batch.record_response(index, status, body.clone())?;
            self.store.update_responses(batch.id, &batch.responses).await?;

            let settled = self
                .sequential_timestamps(
                    batch,
                    index,
                    &body,
                    &prepared.milestones,
                    status,
                    profile.send_timestamps,
                    item.request_type,
                    (all_passed, is_retrying),
                )
                .await?;
            all_passed = settled.0;
            is_retrying = settled.1;

            if is_retrying {
                batch.retry_count += 1;
                self.store.update_retry_count(batch.id, batch.retry_count).await?;
                break;
            }

            if status == Some(200)
                && let Some(confirmation) = reduce::extract_confirmation(
                    item.request_type,
                    &prepared.payload,
                    &body,
                    batch,
                    prepared.case_id.as_deref(),
                )?
            {
                confirmations.push(confirmation);
            }
        }

        batch.confirmation_numbers = confirmations;
        self.store
            .update_confirmations(batch.id, &batch.confirmation_numbers)
            .await?;

        Ok(RoundOutcome {
            all_passed,
            is_retrying,
        })
    }

    /// One sequential partner call with the per-type payload shaping.
    async fn sequential_call(
        &self,
        batch: &mut Batch,
        index: usize,
        item: &crate::domain::item::WorkItem,
        prepared: &payload::PreparedPayload,
        cached: Option<&crate::domain::item::ResponseRecord>,
    ) -> Result<(Value, Option<u16>)> {
        let api = self.api.as_ref();
        let timeout = self.call_timeout();

        match item.request_type {
            RequestType::ShipmentCreate => {
                // A cached create that already carries its assigned id is
                // authoritative even across retry rounds.
                if let Some(record) = cached
                    && (record.body.get("shipmentID").is_some()
                        || record.body.get("fcmID").is_some())
                {
                    return Ok((record.body.clone(), record.status_code));
                }

                let (mut body, status) = match batch.poll_url(index) {
                    Some(url) => {
                        let poll_payload = json!({"statusURL": url});
                        call_single(api, OperationKind::Poll, &poll_payload, timeout).await
                    }
                    None => {
                        call_single(
                            api,
                            OperationKind::Submit(item.request_type),
                            &prepared.payload,
                            timeout,
                        )
                        .await
                    }
                };

                if prepared.payload.get("productCode").and_then(Value::as_str) == Some("FCMTR")
                    && let Some(map) = body.as_object_mut()
                {
                    map.insert("productCode".to_string(), Value::String("FCMTR".to_string()));
                }

                if batch.poll_url(index).is_none()
                    && let Some(url) = body.get("statusURL").and_then(Value::as_str)
                {
                    let url = url.to_owned();
                    batch.capture_poll_url(index, Some(&url));
                    self.store
                        .update_status_poll_urls(batch.id, &batch.status_poll_urls)
                        .await?;
                }

                Ok((body, status))
            }
            RequestType::ShipmentUpdate => {
                let mut request = prepared.payload.clone();
                if let Some(map) = request.as_object_mut() {
                    map.insert(
                        "shipmentID".to_string(),
                        Value::String(batch.case_id().to_owned()),
                    );
                }

                let (body, status) =
                    call_single(api, OperationKind::Submit(item.request_type), &request, timeout)
                        .await;

                if matches!(status, Some(200) | Some(400))
                    && body.get("packlineError").and_then(Value::as_bool) == Some(true)
                {
                    self.log.record(TimelineEntry::new(
                        batch.id,
                        "No Packline Data Found",
                        LogStatus::Warning,
                    ));
                }

                Ok((body, status))
            }
            RequestType::CustomsEntry => {
                let mut request = prepared.payload.clone();
                if let Some(map) = request.as_object_mut()
                    && let Some(customs_number) = &batch.customs_number
                {
                    map.insert(
                        "customsJobID".to_string(),
                        Value::String(customs_number.clone()),
                    );
                }

                Ok(call_single(api, OperationKind::Submit(item.request_type), &request, timeout)
                    .await)
            }
            RequestType::Usacustoms => {
                let mut request = prepared.payload.clone();
                if let Some(map) = request.as_object_mut()
                    && let Some(case_id) = &prepared.case_id
                {
                    map.insert("caseID".to_string(), Value::String(case_id.clone()));
                }

                Ok(call_single(api, OperationKind::Submit(item.request_type), &request, timeout)
                    .await)
            }
            _ => Ok(call_single(
                api,
                OperationKind::Submit(item.request_type),
                &prepared.payload,
                timeout,
            )
            .await),
        }
    }

    /// Inline timestamp calls for a successful sequential shipment-create.
    /// Milestones run strictly in order; the first failure stops the run.
    #[allow(clippy::too_many_arguments)]
    async fn sequential_timestamps(
        &self,
        batch: &mut Batch,
        index: usize,
        body: &Value,
        milestones: &[Value],
        status: Option<u16>,
        send_timestamps: bool,
        request_type: RequestType,
        flags: (bool, bool),
    ) -> Result<(bool, bool)> {
        let (mut all_passed, mut is_retrying) = flags;

        if !(status == Some(200)
            && send_timestamps
            && request_type == RequestType::ShipmentCreate
            && !milestones.is_empty())
        {
            return Ok((all_passed, is_retrying));
        }

        let shipment_id = body
            .get("fcmID")
            .or_else(|| body.get("shipmentID"))
            .and_then(reduce::non_empty_string)
            .ok_or(ConsignError::MissingConfirmation {
                request_type,
                field: "shipmentID",
            })?;

        let mut results: Vec<MilestoneResult> = Vec::with_capacity(milestones.len());
        if let Some(record) = batch.response_at(index) {
            results.extend(record.timestamp_responses.iter().take(milestones.len()).cloned());
        }

        for (milestone_index, milestone) in milestones.iter().enumerate() {
            if let Some(existing) = results.get(milestone_index)
                && existing.succeeded()
            {
                continue;
            }

            let request = json!({"milestone": milestone, "shipment_id": shipment_id});
            let (content, ts_status) = call_single(
                self.api.as_ref(),
                OperationKind::Timestamp,
                &request,
                self.call_timeout(),
            )
            .await;

            let result = MilestoneResult {
                status_code: ts_status,
                response_content: content,
                milestone: milestone.clone(),
                shipment_id: Some(shipment_id.clone()),
            };
            let remarks = serde_json::to_string(&result)?;

            if results.len() > milestone_index {
                results[milestone_index] = result;
            } else {
                results.push(result);
            }

            is_retrying = check_retry(
                self.log.as_ref(),
                batch.id,
                "Time Stamp",
                ts_status,
                remarks.clone(),
                batch.retry_count,
                is_retrying,
                &self.config.retry,
            );

            if is_retrying || ts_status != Some(200) {
                all_passed = false;
                break;
            }

            self.log.record(
                TimelineEntry::new(
                    batch.id,
                    "Time Stamp API call was successful",
                    LogStatus::InProgress,
                )
                .with_remarks(remarks)
                .with_action("display_json"),
            );
        }

        if let Some(record) = batch.responses.get_mut(index) {
            record.timestamp_responses = results;
        }

        if !is_retrying {
            batch.retry_count = 0;
        }

        self.store.update_responses(batch.id, &batch.responses).await?;
        self.store.update_retry_count(batch.id, batch.retry_count).await?;

        Ok((all_passed, is_retrying))
    }
}

/// Title-cased request type for timeline messages, e.g. "Shipment-Create".
fn title_label(request_type: RequestType) -> String {
    request_type
        .to_string()
        .split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
