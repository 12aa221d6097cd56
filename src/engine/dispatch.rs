//! Concurrent dispatch gateway: bounded scatter/gather over partner calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::counter;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::{OperationKind, PartnerApi};

/// Synthetic status for a call that exceeded the per-call budget. Retryable.
pub const STATUS_TIMEOUT: u16 = 408;
/// Synthetic status for a transport-level failure. Retryable.
pub const STATUS_TRANSPORT_ERROR: u16 = 502;

/// One slot in a dispatch round.
///
/// `Resolved` slots carry an outcome known before the round starts (a parent
/// that never succeeded, a skipped item) and never touch the network. `Call`
/// slots may still be short-circuited by the cached-200 check.
#[derive(Debug, Clone)]
pub enum DispatchJob {
    Resolved {
        index: usize,
        parent_index: Option<usize>,
        body: Value,
        status: Option<u16>,
    },
    Call {
        index: usize,
        parent_index: Option<usize>,
        operation: OperationKind,
        request_data: Value,
        cached_body: Value,
        cached_status: Option<u16>,
    },
}

impl DispatchJob {
    pub fn index(&self) -> usize {
        match self {
            DispatchJob::Resolved { index, .. } | DispatchJob::Call { index, .. } => *index,
        }
    }
}

/// Result of one dispatch slot, correlated by explicit index.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub index: usize,
    pub parent_index: Option<usize>,
    pub body: Value,
    pub status: Option<u16>,
}

/// Bounded worker pool executing a round of dispatch jobs.
///
/// The caller blocks until every job has completed or individually timed out;
/// there is no partial streaming and no mid-round cancellation. Results come
/// back index-aligned to the submitted job list.
pub struct Dispatcher {
    workers: usize,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(workers: usize, call_timeout: Duration) -> Self {
        Self {
            workers,
            call_timeout,
        }
    }

    /// Run all jobs, up to `workers` in parallel.
    ///
    /// A `Call` job with `cached_status == 200` returns its cached tuple
    /// without a network call, unless the operation is a poll (a poll exists
    /// precisely to refresh a non-terminal cached state). A timeout yields
    /// 408 and a transport error 502, both retryable like any other
    /// non-(200|400) status.
    pub async fn execute<A>(&self, api: Arc<A>, jobs: Vec<DispatchJob>) -> Vec<DispatchOutcome>
    where
        A: PartnerApi + 'static,
    {
        let mut results: Vec<DispatchOutcome> = jobs
            .iter()
            .map(|job| DispatchOutcome {
                index: job.index(),
                parent_index: None,
                body: json!({}),
                status: None,
            })
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut join_set: JoinSet<(usize, DispatchOutcome)> = JoinSet::new();

        for (slot, job) in jobs.into_iter().enumerate() {
            match job {
                DispatchJob::Resolved {
                    index,
                    parent_index,
                    body,
                    status,
                } => {
                    results[slot] = DispatchOutcome {
                        index,
                        parent_index,
                        body,
                        status,
                    };
                }
                DispatchJob::Call {
                    index,
                    parent_index,
                    operation,
                    request_data,
                    cached_body,
                    cached_status,
                } => {
                    if cached_status == Some(200) && operation != OperationKind::Poll {
                        counter!("consign_dispatch_total", "outcome" => "cached").increment(1);
                        results[slot] = DispatchOutcome {
                            index,
                            parent_index,
                            body: cached_body,
                            status: cached_status,
                        };
                        continue;
                    }

                    let semaphore = semaphore.clone();
                    let in_flight = in_flight.clone();
                    let api = api.clone();
                    let call_timeout = self.call_timeout;

                    join_set.spawn(async move {
                        // Closed only on JoinSet drop, which cannot happen
                        // while this task runs.
                        let Ok(_permit) = semaphore.acquire().await else {
                            return (
                                slot,
                                DispatchOutcome {
                                    index,
                                    parent_index,
                                    body: json!({}),
                                    status: Some(STATUS_TRANSPORT_ERROR),
                                },
                            );
                        };

                        in_flight.fetch_add(1, Ordering::Relaxed);
                        let _guard = scopeguard::guard((), {
                            let in_flight = in_flight.clone();
                            move |_| {
                                in_flight.fetch_sub(1, Ordering::Relaxed);
                            }
                        });

                        tracing::debug!(index, operation = %operation, "Dispatching partner call");

                        let (body, status) =
                            match tokio::time::timeout(call_timeout, api.call(operation, &request_data))
                                .await
                            {
                                Ok(Ok(response)) => {
                                    counter!("consign_dispatch_total", "outcome" => "completed")
                                        .increment(1);
                                    (response.body, Some(response.status))
                                }
                                Ok(Err(e)) => {
                                    counter!("consign_dispatch_total", "outcome" => "error")
                                        .increment(1);
                                    tracing::warn!(index, operation = %operation, error = %e, "Partner call failed");
                                    (
                                        json!({"error": e.to_string()}),
                                        Some(STATUS_TRANSPORT_ERROR),
                                    )
                                }
                                Err(_) => {
                                    counter!("consign_dispatch_total", "outcome" => "timeout")
                                        .increment(1);
                                    tracing::warn!(
                                        index,
                                        operation = %operation,
                                        timeout_secs = call_timeout.as_secs(),
                                        "Partner call timed out"
                                    );
                                    (json!({"error": "call timed out"}), Some(STATUS_TIMEOUT))
                                }
                            };

                        (
                            slot,
                            DispatchOutcome {
                                index,
                                parent_index,
                                body,
                                status,
                            },
                        )
                    });
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((slot, outcome)) => results[slot] = outcome,
                Err(e) => {
                    // A panicked task leaves its placeholder in the results;
                    // the reducer counts the missing status as a failure.
                    tracing::error!(error = %e, "Dispatch task failed to join");
                }
            }
        }

        results
    }
}

/// One call outside a gathered round, with the gateway's timeout budget and
/// synthetic status mapping. Used by the sequential paths.
pub async fn call_single<A>(
    api: &A,
    operation: OperationKind,
    payload: &Value,
    call_timeout: Duration,
) -> (Value, Option<u16>)
where
    A: PartnerApi + ?Sized,
{
    match tokio::time::timeout(call_timeout, api.call(operation, payload)).await {
        Ok(Ok(response)) => (response.body, Some(response.status)),
        Ok(Err(e)) => {
            tracing::warn!(operation = %operation, error = %e, "Partner call failed");
            (json!({"error": e.to_string()}), Some(STATUS_TRANSPORT_ERROR))
        }
        Err(_) => {
            tracing::warn!(
                operation = %operation,
                timeout_secs = call_timeout.as_secs(),
                "Partner call timed out"
            );
            (json!({"error": "call timed out"}), Some(STATUS_TIMEOUT))
        }
    }
}
