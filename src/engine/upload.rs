//! Document upload state machine.
//!
//! Fan-out batches upload through the dispatch gateway, one job per item;
//! sequential batches upload file by file within each item and abort the
//! whole remaining pipeline on the first retryable failure. Additional
//! documents wait behind a hard ordering barrier: every primary item must be
//! terminally successful with no retry pending.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::api::{OperationKind, PartnerApi};
use crate::domain::batch::Batch;
use crate::domain::item::{DOC_TYPE_NO_UPLOAD, RequestType};
use crate::domain::profile::Profile;
use crate::error::{ConsignError, Result};
use crate::log::{LogSink, LogStatus, TimelineEntry};
use crate::store::BatchStore;

use super::dispatch::{DispatchJob, Dispatcher, call_single};
use super::retry::{RetryPolicy, settle_round};

const SKIPPED_UPLOAD_ERROR: &str =
    "Document upload was skipped as the corresponding JSON upload API failed";

/// Result of the upload stage, fed into the outcome aggregator.
#[derive(Debug, Clone, Default)]
pub struct UploadOutcome {
    /// True when every attempted upload failed (fan-out) or any upload failed
    /// terminally (sequential).
    pub upload_error: bool,
    /// Per-item correlation identifiers; successful items first, then items
    /// whose primary submission never produced an id.
    pub identifiers: Vec<Option<String>>,
    pub shipment_ids: Vec<String>,
    pub fcm_ids: Vec<String>,
    pub housebill_numbers: Vec<Option<String>>,
    pub is_retrying: bool,
    pub failed_upload_count: usize,
}

pub(super) struct UploadStage<'a, S, L> {
    pub dispatcher: &'a Dispatcher,
    pub store: &'a S,
    pub log: &'a L,
    pub policy: &'a RetryPolicy,
    pub call_timeout: Duration,
}

impl<S, L> UploadStage<'_, S, L>
where
    S: BatchStore,
    L: LogSink,
{
    pub async fn run<A>(
        &self,
        api: Arc<A>,
        batch: &mut Batch,
        profile: &Profile,
    ) -> Result<UploadOutcome>
    where
        A: PartnerApi + 'static,
    {
        let (mut outcome, clearance_numbers) = if batch.is_fan_out {
            (self.fan_out(api.clone(), batch, profile).await?, Vec::new())
        } else {
            self.sequential(api.as_ref(), batch, profile).await?
        };

        if !outcome.is_retrying && !outcome.upload_error {
            let (upload_error, is_retrying) = self
                .additional_documents(api.as_ref(), batch, profile, &outcome, &clearance_numbers)
                .await?;
            outcome.upload_error = upload_error;
            outcome.is_retrying = is_retrying;
        }

        Ok(outcome)
    }

    /// Fan-out upload: one job per item, first attached file only, gathered
    /// through the gateway.
    async fn fan_out<A>(
        &self,
        api: Arc<A>,
        batch: &mut Batch,
        profile: &Profile,
    ) -> Result<UploadOutcome>
    where
        A: PartnerApi + 'static,
    {
        let mut outcome = UploadOutcome::default();
        let mut failed_identifiers = Vec::new();
        let mut jobs = Vec::new();

        for (index, item) in batch.items.iter().enumerate() {
            let Some(record) = batch.responses.get(index) else {
                failed_identifiers.push(None);
                continue;
            };

            let body = &record.body;
            let identifier = body.get("identifier").and_then(Value::as_str).map(str::to_owned);
            let fcm_id = body.get("fcmID").and_then(Value::as_str);
            let shipment_id = body.get("shipmentID").and_then(Value::as_str);

            // An item whose primary submission produced no id cannot be
            // uploaded; its slot resolves to a skipped failure.
            let Some(clearance) = fcm_id.or(shipment_id).map(str::to_owned) else {
                failed_identifiers.push(identifier);
                jobs.push(DispatchJob::Resolved {
                    index,
                    parent_index: None,
                    body: json!({}),
                    status: None,
                });
                continue;
            };

            if fcm_id.is_some() {
                outcome.fcm_ids.push(clearance.clone());
            } else {
                outcome.shipment_ids.push(clearance.clone());
            }
            outcome.identifiers.push(identifier);
            outcome
                .housebill_numbers
                .push(body.get("housebillNumber").and_then(Value::as_str).map(str::to_owned));

            let Some(file) = item.documents.first() else {
                continue;
            };

            let (cached_body, cached_status) = if file.upload_not_required() {
                (json!({"remarks": DOC_TYPE_NO_UPLOAD}), Some(200))
            } else {
                (record.uploaded_doc_body.clone(), record.uploaded_doc_status)
            };

            let mut request_data = json!({
                "file_path": file.path,
                "doc_code": file.doc_code,
            });
            if let Some(map) = request_data.as_object_mut() {
                if fcm_id.is_some() {
                    map.insert("fcmID".to_string(), Value::String(clearance));
                } else {
                    map.insert("customs_clearance_number".to_string(), Value::String(clearance));
                    map.insert(
                        "filing_country".to_string(),
                        Value::String(profile.filing_country().to_owned()),
                    );
                }
            }

            jobs.push(DispatchJob::Call {
                index,
                parent_index: None,
                operation: OperationKind::Upload,
                request_data,
                cached_body,
                cached_status,
            });
        }

        outcome.identifiers.extend(failed_identifiers);

        if jobs.is_empty() || all_uploads_waived(&jobs) {
            return Ok(outcome);
        }

        let total = jobs.len();
        let outcomes = self.dispatcher.execute(api, jobs).await;

        let mut failed = 0;
        let mut is_retrying = false;

        for gathered in outcomes {
            if gathered.status != Some(200) {
                failed += 1;
            }
            if !is_retrying && !matches!(gathered.status, None | Some(200) | Some(400)) {
                is_retrying = true;
            }

            let mut body = gathered.body;
            if let Some(map) = body.as_object_mut()
                && let Some(clearance) = map.remove("customs_clearance_number")
            {
                map.insert("shipmentID".to_string(), clearance);
            }
            if gathered.status.is_none() && body == json!({}) {
                body = json!({"error": SKIPPED_UPLOAD_ERROR});
            }

            if let Some(record) = batch.responses.get_mut(gathered.index) {
                record.uploaded_doc_status = gathered.status;
                record.uploaded_doc_body = body;
            }
        }

        self.store.update_responses(batch.id, &batch.responses).await?;

        let mut retry_count = batch.retry_count;
        is_retrying = settle_round(
            self.log,
            batch.id,
            "Document upload",
            total,
            failed,
            &mut retry_count,
            is_retrying,
            self.policy,
        );
        batch.retry_count = retry_count;
        self.store.update_retry_count(batch.id, retry_count).await?;

        outcome.upload_error = failed == total;
        outcome.failed_upload_count = failed;
        outcome.is_retrying = is_retrying;

        Ok(outcome)
    }

    /// Sequential upload: files within an item strictly in order, fail-fast
    /// across the remaining pipeline on the first retryable failure.
    async fn sequential<A>(
        &self,
        api: &A,
        batch: &mut Batch,
        profile: &Profile,
    ) -> Result<(UploadOutcome, Vec<String>)>
    where
        A: PartnerApi,
    {
        let mut outcome = UploadOutcome::default();
        let mut clearance_numbers = Vec::new();
        let mut break_pipeline = false;

        for index in 0..batch.items.len() {
            if break_pipeline {
                break;
            }

            let item = batch.items[index].clone();
            let Some(record) = batch.responses.get(index) else {
                continue;
            };
            let body = record.body.clone();

            if let Some(shipment_id) = body.get("shipmentID").and_then(Value::as_str) {
                outcome.shipment_ids.push(shipment_id.to_owned());
            }
            if let Some(housebill) = body.get("housebillNumber").and_then(Value::as_str) {
                outcome.housebill_numbers.push(Some(housebill.to_owned()));
            }
            if let Some(fcm_id) = body.get("fcmID").and_then(Value::as_str) {
                outcome.fcm_ids.push(fcm_id.to_owned());
            }

            let clearance = match clearance_number(item.request_type, &body, batch)? {
                ClearanceRule::Skip => continue,
                ClearanceRule::Number(n) => {
                    if let Some(n) = &n {
                        clearance_numbers.push(n.clone());
                    }
                    n
                }
            };

            if batch.responses[index].uploaded_doc_names.len() < item.documents.len() {
                batch.responses[index]
                    .uploaded_doc_names
                    .resize(item.documents.len(), None);
            }

            let is_fcm = body.get("fcmID").and_then(Value::as_str).is_some();

            for (file_index, file) in item.documents.iter().enumerate() {
                if file.upload_not_required() {
                    continue;
                }
                // Filename resumability: this exact file already went up.
                if batch.responses[index].uploaded_doc_names[file_index].as_deref()
                    == Some(file.name.as_str())
                {
                    continue;
                }

                let info = upload_info(
                    item.request_type,
                    file,
                    clearance.as_deref(),
                    is_fcm,
                    profile,
                    batch,
                );

                let (_, status) =
                    call_single(api, OperationKind::Upload, &info, self.call_timeout).await;

                if batch.retry_count < self.policy.max_retry
                    && !matches!(status, Some(200) | Some(400))
                {
                    self.log.record(
                        TimelineEntry::new(
                            batch.id,
                            format!(
                                "Uploading document API failed with status code {}. Retrying in {} seconds.",
                                status_label(status),
                                self.policy.retry_interval_secs
                            ),
                            LogStatus::Warning,
                        )
                        .with_remarks(info.to_string()),
                    );

                    batch.retry_count += 1;
                    self.store.update_retry_count(batch.id, batch.retry_count).await?;
                    outcome.is_retrying = true;
                    break_pipeline = true;
                    break;
                }

                let failed = self
                    .finish_upload(batch, status, &file.name, &info, Some((index, file_index)))
                    .await?;
                if failed {
                    outcome.upload_error = true;
                }
            }
        }

        Ok((outcome, clearance_numbers))
    }

    /// Additional (unassigned) documents. Only reached when every primary
    /// item settled cleanly; fan-out batches skip them with a warning.
    async fn additional_documents<A>(
        &self,
        api: &A,
        batch: &mut Batch,
        profile: &Profile,
        primary: &UploadOutcome,
        clearance_numbers: &[String],
    ) -> Result<(bool, bool)>
    where
        A: PartnerApi,
    {
        let mut upload_error = false;
        let mut is_retrying = false;

        if batch.additional_documents.is_empty() {
            return Ok((upload_error, is_retrying));
        }

        if batch.is_fan_out {
            let names: Vec<&str> = batch
                .additional_documents
                .iter()
                .map(|d| d.name.as_str())
                .collect();
            self.log.record(
                TimelineEntry::new(
                    batch.id,
                    "Uploading of additional documents has been skipped",
                    LogStatus::Warning,
                )
                .with_remarks(json!(names).to_string()),
            );
            return Ok((upload_error, is_retrying));
        }

        let Some(doc_code) = profile.additional_doc_code else {
            upload_error = true;
            self.log.record(TimelineEntry::new(
                batch.id,
                "Uploading additional document failed due to no doc number found in the definition",
                LogStatus::Warning,
            ));
            return Ok((upload_error, is_retrying));
        };

        let joined_clearance = clearance_numbers.join(", ");
        let has_fcm = !primary.fcm_ids.is_empty();
        let case_id = batch
            .items
            .iter()
            .any(|i| i.request_type == RequestType::Usacustoms)
            .then(|| batch.case_id().to_owned());

        for index in 0..batch.additional_documents.len() {
            let doc = batch.additional_documents[index].clone();
            if doc.uploaded {
                continue;
            }

            let mut info = json!({
                "file_path": doc.path,
                "doc_code": doc_code,
                "filing_country": profile.filing_country(),
            });
            if let Some(map) = info.as_object_mut() {
                if let Some(case_id) = &case_id {
                    map.insert("case_id".to_string(), Value::String(case_id.clone()));
                } else if has_fcm {
                    map.insert("fcmID".to_string(), Value::String(joined_clearance.clone()));
                } else if batch.items.iter().any(|i| {
                    matches!(
                        i.request_type,
                        RequestType::ShipmentCreate | RequestType::ShipmentUpdate
                    )
                }) {
                    map.insert("shipmentID".to_string(), Value::String(joined_clearance.clone()));
                } else {
                    map.insert(
                        "customs_clearance_number".to_string(),
                        Value::String(joined_clearance.clone()),
                    );
                }
            }

            let (_, status) =
                call_single(api, OperationKind::Upload, &info, self.call_timeout).await;

            if batch.retry_count < self.policy.max_retry && !matches!(status, Some(200) | Some(400))
            {
                self.log.record(
                    TimelineEntry::new(
                        batch.id,
                        format!(
                            "Uploading additional document API failed with status code {}. Retrying in {} seconds.",
                            status_label(status),
                            self.policy.retry_interval_secs
                        ),
                        LogStatus::Warning,
                    )
                    .with_remarks(info.to_string()),
                );

                batch.retry_count += 1;
                self.store.update_retry_count(batch.id, batch.retry_count).await?;
                is_retrying = true;
                break;
            }

            if status == Some(200) {
                batch.additional_documents[index].uploaded = true;
                self.store
                    .update_additional_documents(batch.id, &batch.additional_documents)
                    .await?;
            }
            if self.finish_upload(batch, status, &doc.name, &info, None).await? {
                upload_error = true;
            }
        }

        Ok((upload_error, is_retrying))
    }

    /// Shared tail of a single upload: reset the retry counter on success,
    /// record the file name for resumability, and write the timeline entry.
    /// Returns true when the upload failed.
    async fn finish_upload(
        &self,
        batch: &mut Batch,
        status: Option<u16>,
        file_name: &str,
        info: &Value,
        slot: Option<(usize, usize)>,
    ) -> Result<bool> {
        let kind = if slot.is_some() { "document" } else { "additional document" };
        let failed = status != Some(200);

        if !failed {
            batch.retry_count = 0;
            self.store.update_retry_count(batch.id, 0).await?;

            if let Some((index, file_index)) = slot {
                batch.responses[index].uploaded_doc_names[file_index] = Some(file_name.to_owned());
                self.store.update_responses(batch.id, &batch.responses).await?;
            }
        }

        let (api_status, log_status) = if failed {
            ("failed", LogStatus::Warning)
        } else {
            ("successful", LogStatus::InProgress)
        };

        self.log.record(
            TimelineEntry::new(
                batch.id,
                format!(
                    "Uploading {kind} '{file_name}' {api_status} with status code {}",
                    status_label(status)
                ),
                log_status,
            )
            .with_remarks(info.to_string()),
        );

        Ok(failed)
    }
}

enum ClearanceRule {
    /// Item type is excluded from document upload entirely.
    Skip,
    Number(Option<String>),
}

/// Customs clearance number for an item, per request type. Commercial-invoice
/// and dsc-wms items never upload documents.
fn clearance_number(
    request_type: RequestType,
    body: &Value,
    batch: &Batch,
) -> Result<ClearanceRule> {
    let number = match request_type {
        RequestType::CommercialInvoice | RequestType::DscWms => return Ok(ClearanceRule::Skip),
        RequestType::ShipmentCreate | RequestType::ShipmentUpdate => {
            match body.get("fcmID").and_then(Value::as_str) {
                Some(fcm_id) => Some(fcm_id.to_owned()),
                None => Some(
                    body.get("shipmentID")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .ok_or(ConsignError::MissingConfirmation {
                            request_type,
                            field: "shipmentID",
                        })?,
                ),
            }
        }
        RequestType::Booking => Some(
            body.get("customsJobNumber")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or(ConsignError::MissingConfirmation {
                    request_type,
                    field: "customsJobNumber",
                })?,
        ),
        RequestType::CustomsEntry => batch.customs_number.clone(),
        RequestType::Freight => Some(
            body.pointer("/shipment/id")
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or(ConsignError::MissingConfirmation {
                    request_type,
                    field: "shipment.id",
                })?,
        ),
        RequestType::Usacustoms => None,
    };

    Ok(ClearanceRule::Number(number))
}

/// Per-file upload payload for the sequential path.
fn upload_info(
    request_type: RequestType,
    file: &crate::domain::item::DocumentFile,
    clearance: Option<&str>,
    is_fcm: bool,
    profile: &Profile,
    batch: &Batch,
) -> Value {
    let mut info = json!({
        "file_path": file.path,
        "doc_code": file.doc_code,
        "filing_country": profile.filing_country(),
    });

    if let Some(map) = info.as_object_mut() {
        match request_type {
            RequestType::ShipmentCreate | RequestType::ShipmentUpdate => {
                let key = if is_fcm { "fcmID" } else { "shipmentID" };
                map.insert(
                    key.to_string(),
                    Value::String(clearance.unwrap_or_default().to_owned()),
                );
            }
            RequestType::Usacustoms => {
                map.insert("case_id".to_string(), Value::String(batch.case_id().to_owned()));
            }
            _ => {
                map.insert(
                    "customs_clearance_number".to_string(),
                    Value::String(clearance.unwrap_or_default().to_owned()),
                );
            }
        }
    }

    info
}

/// True when every slot in the round is either waived by the "no upload
/// required" sentinel or empty, so the gateway can be skipped entirely.
fn all_uploads_waived(jobs: &[DispatchJob]) -> bool {
    let mut waived = 0;
    let mut empty = 0;

    for job in jobs {
        match job {
            DispatchJob::Call { cached_body, .. }
                if cached_body.get("remarks").and_then(Value::as_str)
                    == Some(DOC_TYPE_NO_UPLOAD) =>
            {
                waived += 1;
            }
            DispatchJob::Resolved { .. } => empty += 1,
            _ => {}
        }
    }

    waived != 0 && waived + empty == jobs.len()
}

fn status_label(status: Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}
