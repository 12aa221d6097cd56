//! Response reduction: merges gathered dispatch results back into the batch.

use metrics::counter;
use serde_json::Value;

use crate::domain::batch::Batch;
use crate::domain::item::RequestType;
use crate::error::{ConsignError, Result};

use super::dispatch::DispatchOutcome;

/// Milestone work derived from one primary item, filled in during reduction
/// with the shipment id the partner assigned.
#[derive(Debug, Clone, Default)]
pub struct MilestoneTarget {
    pub milestones: Vec<Value>,
    pub shipment_id: Option<String>,
}

/// Classification of one reduced round.
#[derive(Debug, Clone)]
pub struct RoundStats {
    /// True when any item in the round came back 200.
    pub all_passed: bool,
    /// True when any item came back with a non-terminal status.
    pub is_retrying: bool,
    pub failed_count: usize,
    pub confirmations: Vec<String>,
}

/// Merge one fan-out round into the batch.
///
/// Re-attaches identifiers, captures status poll URLs on first sight, counts
/// failures, extracts shipment/FCM confirmations and applies the FCMTR
/// product-code passthrough. Records are persisted by index; a correlation
/// fault (index the stored array cannot accept) is counted as a failure and
/// logged but never aborts the batch.
pub fn reduce_submit_round(
    batch: &mut Batch,
    outcomes: Vec<DispatchOutcome>,
    identifiers: &[Option<String>],
    milestone_targets: &mut [MilestoneTarget],
) -> RoundStats {
    let mut failed_count = 0;
    let mut all_passed = false;
    let mut is_retrying = false;
    let mut confirmations = Vec::new();

    let fcmtr_passthrough = batch
        .items
        .first()
        .and_then(|item| item.payload.get("productCode"))
        .and_then(Value::as_str)
        == Some("FCMTR");

    for outcome in outcomes {
        let DispatchOutcome { index, mut body, status, .. } = outcome;

        if let Some(identifier) = identifiers.get(index).cloned().flatten()
            && let Some(map) = body.as_object_mut()
        {
            map.insert("identifier".to_string(), Value::String(identifier));
        }

        if batch.poll_url(index).is_none() {
            let url = body.get("statusURL").and_then(Value::as_str).map(str::to_owned);
            batch.capture_poll_url(index, url.as_deref());
        }

        if status != Some(200) {
            failed_count += 1;
        }

        let confirmation = body
            .get("fcmID")
            .or_else(|| body.get("shipmentID"))
            .and_then(non_empty_string);

        if let Some(confirmation) = confirmation {
            confirmations.push(confirmation.clone());
            if let Some(target) = milestone_targets.get_mut(index) {
                target.shipment_id = Some(confirmation);
            }
        }

        if !is_retrying && !matches!(status, Some(200) | Some(400)) {
            is_retrying = true;
        }

        if !all_passed && status == Some(200) {
            all_passed = true;
        }

        if fcmtr_passthrough && let Some(map) = body.as_object_mut() {
            map.insert("productCode".to_string(), Value::String("FCMTR".to_string()));
        }

        if let Err(e) = batch.record_response(index, status, body) {
            counter!("consign_correlation_faults_total").increment(1);
            tracing::error!(batch_id = %batch.id, index, error = %e, "Dropped uncorrelatable response");
            if status == Some(200) {
                failed_count += 1;
            }
        }
    }

    RoundStats {
        all_passed,
        is_retrying,
        failed_count,
        confirmations,
    }
}

/// Extract the confirmation identifier for a 200 response on the sequential
/// path. A missing field here is a mapping defect, fatal for the batch.
pub fn extract_confirmation(
    request_type: RequestType,
    request_payload: &Value,
    body: &Value,
    batch: &Batch,
    case_id: Option<&str>,
) -> Result<Option<String>> {
    let confirmation = match request_type {
        RequestType::DscWms => Some(require_field(
            request_payload.get("deliverynoteNo"),
            request_type,
            "deliverynoteNo",
        )?),
        RequestType::ShipmentCreate | RequestType::ShipmentUpdate => {
            match body.get("fcmID").and_then(non_empty_string) {
                Some(fcm_id) => Some(fcm_id),
                None => Some(require_field(body.get("shipmentID"), request_type, "shipmentID")?),
            }
        }
        RequestType::CommercialInvoice => {
            let detail = require_field(body.get("detail"), request_type, "detail")?;
            let number = detail
                .replace("Commercial Invoice ", "")
                .replace(" created successfully", "");
            // Whitespace in the remainder means the detail text did not have
            // the expected shape; discard rather than report a bogus number.
            if number.contains(' ') { None } else { Some(number) }
        }
        RequestType::Booking => Some(require_field(
            body.get("customsJobNumber"),
            request_type,
            "customsJobNumber",
        )?),
        RequestType::CustomsEntry => batch.customs_number.clone(),
        RequestType::Usacustoms => case_id.map(str::to_owned),
        RequestType::Freight => Some(require_field(
            body.pointer("/shipment/id"),
            request_type,
            "shipment.id",
        )?),
    };

    Ok(confirmation)
}

fn require_field(
    value: Option<&Value>,
    request_type: RequestType,
    field: &'static str,
) -> Result<String> {
    value
        .and_then(non_empty_string)
        .ok_or(ConsignError::MissingConfirmation { request_type, field })
}

/// Normalize an id value: non-empty strings pass through, numbers stringify.
pub(super) fn non_empty_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::WorkItem;
    use serde_json::json;

    fn batch_with_payloads(payloads: Vec<Value>) -> Batch {
        let items = payloads
            .into_iter()
            .map(|payload| WorkItem {
                request_type: RequestType::ShipmentCreate,
                payload,
                documents: vec![],
            })
            .collect();
        Batch::new("CASE9_set", items, true)
    }

    fn outcome(index: usize, status: Option<u16>, body: Value) -> DispatchOutcome {
        DispatchOutcome {
            index,
            parent_index: None,
            body,
            status,
        }
    }

    #[test]
    fn mixed_round_classifies_per_taxonomy() {
        let mut batch = batch_with_payloads(vec![json!({}), json!({}), json!({})]);
        let mut targets = vec![MilestoneTarget::default(); 3];

        let stats = reduce_submit_round(
            &mut batch,
            vec![
                outcome(0, Some(200), json!({"shipmentID": "S1"})),
                outcome(1, Some(500), json!({"error": "oops"})),
                outcome(2, Some(400), json!({"error": "bad payload"})),
            ],
            &[None, None, None],
            &mut targets,
        );

        assert!(stats.all_passed);
        assert!(stats.is_retrying);
        assert_eq!(stats.failed_count, 2);
        assert_eq!(stats.confirmations, vec!["S1".to_string()]);
        assert_eq!(targets[0].shipment_id.as_deref(), Some("S1"));
        assert_eq!(batch.responses[1].status_code, Some(500));
    }

    #[test]
    fn identifier_reattached_and_poll_url_captured_once() {
        let mut batch = batch_with_payloads(vec![json!({})]);
        let mut targets = vec![MilestoneTarget::default()];

        reduce_submit_round(
            &mut batch,
            vec![outcome(
                0,
                Some(202),
                json!({"statusURL": "https://partner/poll/0"}),
            )],
            &[Some("row-1".to_string())],
            &mut targets,
        );

        assert_eq!(batch.poll_url(0), Some("https://partner/poll/0"));
        assert_eq!(batch.responses[0].body["identifier"], "row-1");
    }

    #[test]
    fn fcmtr_product_code_passes_through_to_every_body() {
        let mut batch =
            batch_with_payloads(vec![json!({"productCode": "FCMTR"}), json!({})]);
        let mut targets = vec![MilestoneTarget::default(); 2];

        reduce_submit_round(
            &mut batch,
            vec![
                outcome(0, Some(200), json!({"shipmentID": "S1"})),
                outcome(1, Some(200), json!({"shipmentID": "S2"})),
            ],
            &[None, None],
            &mut targets,
        );

        assert_eq!(batch.responses[0].body["productCode"], "FCMTR");
        assert_eq!(batch.responses[1].body["productCode"], "FCMTR");
    }

    #[test]
    fn correlation_fault_is_contained() {
        let mut batch = batch_with_payloads(vec![json!({})]);
        let mut targets = vec![MilestoneTarget::default()];

        // Index 5 can neither update nor append; the round must still settle.
        let stats = reduce_submit_round(
            &mut batch,
            vec![outcome(5, Some(200), json!({"shipmentID": "S9"}))],
            &[],
            &mut targets,
        );

        assert_eq!(stats.failed_count, 1);
        assert!(batch.responses.is_empty());
    }

    #[test]
    fn fcm_id_wins_over_shipment_id() {
        let batch = batch_with_payloads(vec![json!({})]);
        let confirmation = extract_confirmation(
            RequestType::ShipmentCreate,
            &json!({}),
            &json!({"fcmID": "F77", "shipmentID": "S77"}),
            &batch,
            None,
        )
        .unwrap();
        assert_eq!(confirmation.as_deref(), Some("F77"));
    }

    #[test]
    fn commercial_invoice_detail_is_sanitized() {
        let batch = batch_with_payloads(vec![json!({})]);
        let confirmation = extract_confirmation(
            RequestType::CommercialInvoice,
            &json!({}),
            &json!({"detail": "Commercial Invoice INV-42 created successfully"}),
            &batch,
            None,
        )
        .unwrap();
        assert_eq!(confirmation.as_deref(), Some("INV-42"));

        let malformed = extract_confirmation(
            RequestType::CommercialInvoice,
            &json!({}),
            &json!({"detail": "something else entirely"}),
            &batch,
            None,
        )
        .unwrap();
        assert!(malformed.is_none());
    }

    #[test]
    fn missing_confirmation_field_is_a_fatal_fault() {
        let batch = batch_with_payloads(vec![json!({})]);
        let err = extract_confirmation(
            RequestType::ShipmentCreate,
            &json!({}),
            &json!({"unexpected": true}),
            &batch,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConsignError::MissingConfirmation { field: "shipmentID", .. }
        ));
    }

    #[test]
    fn freight_confirmation_comes_from_nested_shipment_id() {
        let batch = batch_with_payloads(vec![json!({})]);
        let confirmation = extract_confirmation(
            RequestType::Freight,
            &json!({}),
            &json!({"shipment": {"id": 90210}}),
            &batch,
            None,
        )
        .unwrap();
        assert_eq!(confirmation.as_deref(), Some("90210"));
    }
}
