//! Error types for the submission engine.

use thiserror::Error;

use crate::domain::batch::BatchId;
use crate::domain::item::RequestType;

/// Result type alias using the consign error type.
pub type Result<T> = std::result::Result<T, ConsignError>;

/// Main error type for the submission engine.
#[derive(Error, Debug)]
pub enum ConsignError {
    /// Batch not found in the store
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// A response arrived for an index the stored array cannot accept.
    /// Callers inside the reducer catch this, count the item as failed and
    /// keep going; it must never abort the batch.
    #[error("Response index {index} out of range (stored responses: {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// A 200 response is missing the field the confirmation rule expects.
    /// This indicates a configuration/mapping defect and is fatal for the
    /// batch.
    #[error("Missing confirmation field '{field}' in {request_type} response")]
    MissingConfirmation {
        request_type: RequestType,
        field: &'static str,
    },

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
