//! Persistence of batch state.
//!
//! The engine persists through the [`BatchStore`] trait so the retry driver
//! can resume a batch from durable state after a process restart. The
//! partial-update methods exist so concurrent pipeline stages do not clobber
//! each other's fields with a whole-aggregate write.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::batch::{AdditionalDocument, Batch, BatchId};
use crate::domain::item::ResponseRecord;
use crate::error::{ConsignError, Result};

/// Storage backend for batch aggregates.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a new batch or replace an existing one wholesale.
    async fn save(&self, batch: &Batch) -> Result<()>;

    /// Load a batch by id.
    async fn load(&self, id: BatchId) -> Result<Batch>;

    /// Replace the full response array.
    async fn update_responses(&self, id: BatchId, responses: &[ResponseRecord]) -> Result<()>;

    /// Update the retry counter.
    async fn update_retry_count(&self, id: BatchId, retry_count: u32) -> Result<()>;

    /// Replace the per-index status poll URLs.
    async fn update_status_poll_urls(&self, id: BatchId, urls: &[Option<String>]) -> Result<()>;

    /// Replace the confirmation number list.
    async fn update_confirmations(&self, id: BatchId, confirmations: &[String]) -> Result<()>;

    /// Replace the additional-document list (upload flags included).
    async fn update_additional_documents(
        &self,
        id: BatchId,
        documents: &[AdditionalDocument],
    ) -> Result<()>;
}

/// In-memory store backed by a mutex-guarded map. Suitable for tests and for
/// single-process deployments where durability is handled upstream.
#[derive(Default)]
pub struct InMemoryBatchStore {
    batches: parking_lot::Mutex<HashMap<BatchId, Batch>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_batch<T>(&self, id: BatchId, f: impl FnOnce(&mut Batch) -> T) -> Result<T> {
        let mut batches = self.batches.lock();
        let batch = batches.get_mut(&id).ok_or(ConsignError::BatchNotFound(id))?;
        Ok(f(batch))
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn save(&self, batch: &Batch) -> Result<()> {
        self.batches.lock().insert(batch.id, batch.clone());
        Ok(())
    }

    async fn load(&self, id: BatchId) -> Result<Batch> {
        self.batches
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ConsignError::BatchNotFound(id))
    }

    async fn update_responses(&self, id: BatchId, responses: &[ResponseRecord]) -> Result<()> {
        self.with_batch(id, |b| b.responses = responses.to_vec())
    }

    async fn update_retry_count(&self, id: BatchId, retry_count: u32) -> Result<()> {
        self.with_batch(id, |b| b.retry_count = retry_count)
    }

    async fn update_status_poll_urls(&self, id: BatchId, urls: &[Option<String>]) -> Result<()> {
        self.with_batch(id, |b| b.status_poll_urls = urls.to_vec())
    }

    async fn update_confirmations(&self, id: BatchId, confirmations: &[String]) -> Result<()> {
        self.with_batch(id, |b| b.confirmation_numbers = confirmations.to_vec())
    }

    async fn update_additional_documents(
        &self,
        id: BatchId,
        documents: &[AdditionalDocument],
    ) -> Result<()> {
        self.with_batch(id, |b| b.additional_documents = documents.to_vec())
    }
}
