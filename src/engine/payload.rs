//! Payload preparation: strips transient control fields before dispatch.

use serde_json::Value;

use crate::domain::batch::Batch;
use crate::domain::item::{
    CONTROL_FIELD_BATCH_ID, CONTROL_FIELD_IDENTIFIER, CONTROL_FIELD_MILESTONE, RequestType,
    WorkItem,
};

/// A work item payload cleaned for transmission, with the control fields
/// pulled out for correlation.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub payload: Value,
    pub identifier: Option<String>,
    /// Milestone entries extracted from a shipment-create item when
    /// timestamping is enabled. Empty otherwise.
    pub milestones: Vec<Value>,
    /// Case id derived from the batch subject for usacustoms items.
    pub case_id: Option<String>,
}

/// Clean one work item for dispatch. Pure: the item itself is not mutated.
///
/// All three control fields are always removed; `identifier` is returned for
/// correlation, and the `milestone` list is kept only for shipment-create
/// items with timestamping enabled.
pub fn prepare(item: &WorkItem, batch: &Batch, send_timestamps: bool) -> PreparedPayload {
    let mut payload = item.payload.clone();
    let mut identifier = None;
    let mut milestones = Vec::new();
    let mut case_id = None;

    if let Some(map) = payload.as_object_mut() {
        map.remove(CONTROL_FIELD_BATCH_ID);

        identifier = map
            .remove(CONTROL_FIELD_IDENTIFIER)
            .and_then(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            });

        if let Some(Value::Array(entries)) = map.remove(CONTROL_FIELD_MILESTONE)
            && item.request_type == RequestType::ShipmentCreate
            && send_timestamps
        {
            milestones = entries;
        }
    }

    if item.request_type == RequestType::Usacustoms {
        case_id = Some(batch.case_id().to_owned());
    }

    PreparedPayload {
        payload,
        identifier,
        milestones,
        case_id,
    }
}
