//! Work items and their per-index response records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control fields carried in a work item payload for correlation and routing.
/// They must never appear in an outbound request.
pub const CONTROL_FIELD_BATCH_ID: &str = "batchid";
pub const CONTROL_FIELD_IDENTIFIER: &str = "identifier";
pub const CONTROL_FIELD_MILESTONE: &str = "milestone";

/// Document type sentinel: the file exists but the partner must not receive it.
pub const DOC_TYPE_NO_UPLOAD: &str = "Processing Document No Upload";

/// The closed set of outbound request types the engine knows how to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    ShipmentCreate,
    ShipmentUpdate,
    DscWms,
    Freight,
    CustomsEntry,
    Usacustoms,
    CommercialInvoice,
    Booking,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestType::ShipmentCreate => "shipment-create",
            RequestType::ShipmentUpdate => "shipment-update",
            RequestType::DscWms => "dsc-wms",
            RequestType::Freight => "freight",
            RequestType::CustomsEntry => "customs-entry",
            RequestType::Usacustoms => "usacustoms",
            RequestType::CommercialInvoice => "commercial-invoice",
            RequestType::Booking => "booking",
        };
        write!(f, "{}", name)
    }
}

/// A file attached to a work item, destined for the partner's document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFile {
    pub name: String,
    pub path: String,
    /// Document type label from the matched profile definition.
    pub doc_type: String,
    /// Partner-side document code resolved from the type, when known.
    pub doc_code: Option<u32>,
}

impl DocumentFile {
    /// Whether this file is the "no upload required" sentinel.
    pub fn upload_not_required(&self) -> bool {
        self.doc_type == DOC_TYPE_NO_UPLOAD
    }
}

/// One outbound unit of submission.
///
/// The payload is the partner-facing JSON object plus the transient control
/// fields (`identifier`, `milestone`, `batchid`) stripped by the payload
/// preparer before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub request_type: RequestType,
    pub payload: Value,
    /// Files produced for this item by the upstream pipeline.
    #[serde(default)]
    pub documents: Vec<DocumentFile>,
}

/// Outcome of one milestone timestamp call, stored under the parent item's
/// response record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneResult {
    pub status_code: Option<u16>,
    pub response_content: Value,
    pub milestone: Value,
    pub shipment_id: Option<String>,
}

impl MilestoneResult {
    pub fn succeeded(&self) -> bool {
        self.status_code == Some(200)
    }
}

/// The per-index record of what the partner answered for a work item.
///
/// `status_code` is `None` until the item has been dispatched at least once
/// (or when the slot was filled by a derived failure). A record with
/// `status_code == Some(200)` is authoritative and short-circuits all future
/// dispatch of its index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status_code: Option<u16>,
    pub body: Value,
    /// One entry per milestone of the parent item, in milestone order.
    #[serde(default)]
    pub timestamp_responses: Vec<MilestoneResult>,
    /// Parallel to the item's file list; a slot holds the file name once that
    /// file has been uploaded. Used for filename-based resumability.
    #[serde(default)]
    pub uploaded_doc_names: Vec<Option<String>>,
    pub uploaded_doc_status: Option<u16>,
    #[serde(default)]
    pub uploaded_doc_body: Value,
}

impl ResponseRecord {
    pub fn new(status_code: Option<u16>, body: Value) -> Self {
        Self {
            status_code,
            body,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status_code == Some(200)
    }
}
