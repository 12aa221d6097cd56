//! Submission profiles: per-customer routing configuration resolved upstream.

use serde::{Deserialize, Serialize};

/// Profile the upstream pipeline matched for the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name; the first two characters encode the filing country.
    pub name: String,
    /// Whether successful shipment creations trigger milestone timestamp calls.
    pub send_timestamps: bool,
    /// Partner document code for additional (unassigned) documents, when the
    /// definition settings carry one.
    pub additional_doc_code: Option<u32>,
}

impl Profile {
    pub fn filing_country(&self) -> &str {
        let end = self
            .name
            .char_indices()
            .nth(2)
            .map_or(self.name.len(), |(i, _)| i);
        &self.name[..end]
    }
}
