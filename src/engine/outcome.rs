//! Outcome aggregation: the consolidated report handed back to the caller.

use serde_json::{Value, json};

use crate::domain::batch::Batch;

use super::upload::UploadOutcome;

/// Build the outcome message and context object for a finished batch.
///
/// Fan-out batches get a per-item table of (identifier, assigned id,
/// housebill) rows zipped to the longest list, plus an error count taken from
/// whichever failure source is non-zero. Sequential batches get comma-joined
/// confirmation numbers, deduplicated housebills, and the id joins.
pub fn build_outcome_context(
    batch: &Batch,
    upload: &UploadOutcome,
    failed_api_call_count: usize,
) -> (Value, String) {
    let mut message = "Submission process completed successfully".to_string();

    if batch.is_fan_out {
        let mut error_count = 0;
        if failed_api_call_count > 0 || upload.failed_upload_count > 0 {
            message = "Submission process was partially completed".to_string();
            error_count = if failed_api_call_count > 0 {
                failed_api_call_count
            } else {
                upload.failed_upload_count
            };
        }

        let (ids, id_type): (&[String], &str) = if !upload.shipment_ids.is_empty() {
            (&upload.shipment_ids, "Shipment ID")
        } else if !upload.fcm_ids.is_empty() {
            (&upload.fcm_ids, "FCM ID")
        } else {
            (&[], "")
        };

        let rows = if id_type.is_empty() {
            Vec::new()
        } else {
            zip_longest(&upload.identifiers, ids, &upload.housebill_numbers)
        };

        let context = json!({
            "error_count_dict": {
                "error_count": error_count,
                "has_api_call_failure": failed_api_call_count != 0,
            },
            "multi_shipment_info": rows,
            "id_type": id_type,
        });

        return (context, message);
    }

    let mut context = json!({
        "confirmation_numbers": batch.confirmation_numbers.join(","),
    });

    if let Some(map) = context.as_object_mut() {
        let housebills: Vec<&str> = dedup_preserving_order(
            upload
                .housebill_numbers
                .iter()
                .filter_map(|h| h.as_deref()),
        );
        if !housebills.is_empty() {
            map.insert(
                "housebillNumber".to_string(),
                Value::String(housebills.join(",")),
            );
        }

        if !upload.shipment_ids.is_empty() {
            map.insert(
                "shipmentID".to_string(),
                Value::String(upload.shipment_ids.join(",")),
            );
        }

        if !upload.fcm_ids.is_empty() {
            map.insert("fcmID".to_string(), Value::String(upload.fcm_ids.join(",")));
        }
    }

    (context, message)
}

/// Row-wise zip padded with nulls to the longest input.
fn zip_longest(
    identifiers: &[Option<String>],
    ids: &[String],
    housebills: &[Option<String>],
) -> Vec<Value> {
    let len = identifiers.len().max(ids.len()).max(housebills.len());

    (0..len)
        .map(|i| {
            json!([
                identifiers.get(i).cloned().flatten(),
                ids.get(i),
                housebills.get(i).cloned().flatten(),
            ])
        })
        .collect()
}

fn dedup_preserving_order<'a>(values: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = Vec::new();
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}
