//! Partner API abstraction for making remote calls.
//!
//! This module defines the `PartnerApi` trait to abstract the per-operation
//! remote calls, enabling testability with mock implementations. The engine
//! never shapes wire formats itself; it hands a prepared JSON payload to the
//! operation and gets back `(body, status)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::item::RequestType;
use crate::error::Result;

/// Response from a partner API call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP-style status code
    pub status: u16,
    /// Response body as JSON
    pub body: Value,
}

/// The operations the engine dispatches. Selection is data-dependent: an item
/// whose index has a recorded status poll URL dispatches `Poll` instead of
/// its submit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Primary submission for a work item.
    Submit(RequestType),
    /// Second leg of an async create→poll chain.
    Poll,
    /// Milestone timestamp for a created shipment.
    Timestamp,
    /// Document upload to the partner's document store.
    Upload,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Submit(rt) => write!(f, "{}", rt),
            OperationKind::Poll => write!(f, "status-poll"),
            OperationKind::Timestamp => write!(f, "timestamp"),
            OperationKind::Upload => write!(f, "document-upload"),
        }
    }
}

/// Trait for executing partner API operations.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the dispatch logic testable without real network calls.
/// A non-2xx status is not an `Err`; errors are reserved for transport-level
/// failures, which the gateway maps to a retryable synthetic status.
#[async_trait]
pub trait PartnerApi: Send + Sync {
    /// Execute one operation against the partner.
    async fn call(&self, operation: OperationKind, payload: &Value) -> Result<ApiResponse>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production partner client posting JSON to a per-operation route.
#[derive(Clone)]
pub struct HttpPartnerApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPartnerApi {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn route(&self, operation: OperationKind) -> String {
        let path = match operation {
            OperationKind::Submit(rt) => format!("/v1/submissions/{}", rt),
            OperationKind::Poll => "/v1/status".to_string(),
            OperationKind::Timestamp => "/v1/timestamps".to_string(),
            OperationKind::Upload => "/v1/documents".to_string(),
        };
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PartnerApi for HttpPartnerApi {
    #[tracing::instrument(skip(self, payload), fields(operation = %operation))]
    async fn call(&self, operation: OperationKind, payload: &Value) -> Result<ApiResponse> {
        // Polls go to the URL the create response handed back, not a route.
        let url = match operation {
            OperationKind::Poll => payload
                .get("statusURL")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| self.route(operation)),
            _ => self.route(operation),
        };

        tracing::debug!(url = %url, "Executing partner API call");

        let mut req = self.client.post(&url).json(payload);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(url = %url, error = %e, "Partner API call failed");
            e
        })?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "detail": text }));

        tracing::info!(status = status, "Partner API call completed");

        Ok(ApiResponse { status, body })
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;

/// Mock partner API for testing.
///
/// Allows configuring predetermined responses per operation without making
/// actual network calls. Responses for the same operation are returned in
/// FIFO order.
///
/// # Example
/// ```ignore
/// let mock = MockPartnerApi::new();
/// mock.add_response(
///     OperationKind::Submit(RequestType::ShipmentCreate),
///     Ok(ApiResponse { status: 200, body: json!({"shipmentID": "S1"}) }),
/// );
/// ```
#[derive(Default)]
pub struct MockPartnerApi {
    responses: Mutex<HashMap<OperationKind, Vec<Result<ApiResponse>>>>,
    calls: Mutex<Vec<MockCall>>,
}

/// Record of a call made to the mock partner API.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: OperationKind,
    pub payload: Value,
}

impl MockPartnerApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for an operation. Multiple responses for the same
    /// operation are served in FIFO order.
    pub fn add_response(&self, operation: OperationKind, response: Result<ApiResponse>) {
        self.responses.lock().entry(operation).or_default().push(response);
    }

    /// Queue the same successful response `n` times.
    pub fn add_responses(&self, operation: OperationKind, response: ApiResponse, n: usize) {
        let mut responses = self.responses.lock();
        let queue = responses.entry(operation).or_default();
        for _ in 0..n {
            queue.push(Ok(response.clone()));
        }
    }

    /// Get all calls that have been made to this mock.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Get the number of calls made for one operation.
    pub fn call_count_for(&self, operation: OperationKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }
}

#[async_trait]
impl PartnerApi for MockPartnerApi {
    async fn call(&self, operation: OperationKind, payload: &Value) -> Result<ApiResponse> {
        self.calls.lock().push(MockCall {
            operation,
            payload: payload.clone(),
        });

        let mock_response = {
            let mut responses = self.responses.lock();
            responses.get_mut(&operation).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };

        match mock_response {
            Some(response) => response,
            None => Err(crate::error::ConsignError::Other(anyhow::anyhow!(
                "No mock response configured for {}",
                operation
            ))),
        }
    }
}
