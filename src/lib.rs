//! Outbound submission engine for document-intelligence batches.
//!
//! Once a document batch has been classified, extracted and normalized into
//! structured work items (shipment creations, customs entries, freight
//! bookings, document uploads, milestone timestamps), this crate delivers
//! each item to an external partner API, tracks per-item outcome, retries
//! transient failures without re-doing completed work, and produces a
//! consolidated success / partial-failure report.
//!
//! The engine is generic over three injected collaborators: a [`PartnerApi`]
//! that performs the actual remote calls, a [`BatchStore`] that persists the
//! batch aggregate, and a [`LogSink`] that receives the user-facing timeline.

pub mod api;
pub mod domain;
pub mod engine;
pub mod error;
pub mod log;
pub mod store;

// Re-export commonly used types
pub use api::{ApiResponse, HttpPartnerApi, MockPartnerApi, OperationKind, PartnerApi};
pub use domain::batch::{AdditionalDocument, Batch, BatchId};
pub use domain::item::{DocumentFile, MilestoneResult, RequestType, ResponseRecord, WorkItem};
pub use domain::profile::Profile;
pub use engine::retry::RetryPolicy;
pub use engine::upload::UploadOutcome;
pub use engine::{EngineConfig, RoundOutcome, SubmissionEngine};
pub use error::{ConsignError, Result};
pub use log::{LogSink, LogStatus, MemoryLogSink, TimelineEntry, TracingLogSink};
pub use store::{BatchStore, InMemoryBatchStore};
