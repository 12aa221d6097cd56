//! The batch aggregate: ordered work items with index-aligned response state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConsignError, Result};

use super::item::{ResponseRecord, WorkItem};

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A document attached to the batch but not assigned to any work item.
/// Uploaded only after every primary item has a terminal success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalDocument {
    pub name: String,
    pub path: String,
    pub uploaded: bool,
}

/// Aggregate root for one inbound document set.
///
/// `responses`, `status_poll_urls` and `items` are index-aligned; `responses`
/// may be shorter than `items` while a round is still in flight, and only
/// ever grows by appending at the next slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// Originating subject line of the document set. The usacustoms case id
    /// is derived from its first `_`-separated segment.
    pub subject: String,
    /// Externally assigned customs number, when the upstream pipeline set one.
    pub customs_number: Option<String>,
    pub items: Vec<WorkItem>,
    pub responses: Vec<ResponseRecord>,
    pub retry_count: u32,
    pub confirmation_numbers: Vec<String>,
    /// Per-index status poll URL for async create→poll chains.
    pub status_poll_urls: Vec<Option<String>>,
    pub additional_documents: Vec<AdditionalDocument>,
    /// Multi-item concurrent mode vs sequential single-type mode.
    pub is_fan_out: bool,
}

impl Batch {
    /// Create a batch with items populated and no response state, the shape
    /// the upstream pipeline hands over.
    pub fn new(subject: impl Into<String>, items: Vec<WorkItem>, is_fan_out: bool) -> Self {
        Self {
            id: BatchId::from(Uuid::new_v4()),
            subject: subject.into(),
            customs_number: None,
            items,
            responses: Vec::new(),
            retry_count: 0,
            confirmation_numbers: Vec::new(),
            status_poll_urls: Vec::new(),
            additional_documents: Vec::new(),
            is_fan_out,
        }
    }

    pub fn response_at(&self, index: usize) -> Option<&ResponseRecord> {
        self.responses.get(index)
    }

    /// Record a response idempotently: update in place if the index already
    /// holds a record, append if the index is exactly the next slot, and
    /// reject anything else so the alignment invariant stays enforceable.
    ///
    /// An in-place update preserves the slot's upload and timestamp state;
    /// those fields are owned by their own pipeline stages.
    pub fn record_response(&mut self, index: usize, status: Option<u16>, body: Value) -> Result<()> {
        if index < self.responses.len() {
            let record = &mut self.responses[index];
            record.status_code = status;
            record.body = body;
            Ok(())
        } else if index == self.responses.len() {
            self.responses.push(ResponseRecord::new(status, body));
            Ok(())
        } else {
            Err(ConsignError::IndexOutOfRange {
                index,
                len: self.responses.len(),
            })
        }
    }

    /// Record the status poll URL for an index if none has been captured yet.
    pub fn capture_poll_url(&mut self, index: usize, url: Option<&str>) {
        if self.status_poll_urls.len() < self.items.len() {
            self.status_poll_urls.resize(self.items.len(), None);
        }
        if let Some(slot) = self.status_poll_urls.get_mut(index)
            && slot.is_none()
        {
            *slot = url.map(str::to_owned);
        }
    }

    pub fn poll_url(&self, index: usize) -> Option<&str> {
        self.status_poll_urls.get(index)?.as_deref()
    }

    /// Whether every item has a terminal record (200 or 400).
    pub fn all_resolved(&self) -> bool {
        self.responses.len() == self.items.len()
            && self
                .responses
                .iter()
                .all(|r| matches!(r.status_code, Some(200) | Some(400)))
    }

    /// First `_`-separated segment of the subject, used as the usacustoms
    /// case id.
    pub fn case_id(&self) -> &str {
        self.subject.split('_').next().unwrap_or(&self.subject)
    }
}
