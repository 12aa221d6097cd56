//! End-to-end submission tests against mock collaborators.

use std::sync::Arc;

use serde_json::{Value, json};

use consign::{
    ApiResponse, Batch, BatchStore, ConsignError, EngineConfig, InMemoryBatchStore, MemoryLogSink,
    MockPartnerApi, OperationKind, Profile, RequestType, RetryPolicy, SubmissionEngine, WorkItem,
};

type Engine = SubmissionEngine<InMemoryBatchStore, MockPartnerApi, MemoryLogSink>;

fn engine(policy: RetryPolicy) -> (Engine, Arc<InMemoryBatchStore>, Arc<MockPartnerApi>, Arc<MemoryLogSink>) {
    let store = Arc::new(InMemoryBatchStore::new());
    let api = Arc::new(MockPartnerApi::new());
    let log = Arc::new(MemoryLogSink::new());

    let config = EngineConfig {
        retry: policy,
        workers: 4,
        call_timeout_ms: 5_000,
        timestamp_rounds: 3,
    };

    (
        SubmissionEngine::new(store.clone(), api.clone(), log.clone(), config),
        store,
        api,
        log,
    )
}

fn profile(send_timestamps: bool) -> Profile {
    Profile {
        name: "DE ShipmentCreate".to_string(),
        send_timestamps,
        additional_doc_code: None,
    }
}

fn create_item(payload: Value) -> WorkItem {
    WorkItem {
        request_type: RequestType::ShipmentCreate,
        payload,
        documents: vec![],
    }
}

fn item_of(request_type: RequestType, payload: Value) -> WorkItem {
    WorkItem {
        request_type,
        payload,
        documents: vec![],
    }
}

fn ok(body: Value) -> consign::Result<ApiResponse> {
    Ok(ApiResponse { status: 200, body })
}

fn status(code: u16, body: Value) -> consign::Result<ApiResponse> {
    Ok(ApiResponse { status: code, body })
}

async fn save(store: &InMemoryBatchStore, batch: &Batch) {
    store.save(batch).await.unwrap();
}

// ---------------------------------------------------------------------------
// Fan-out mode
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn fan_out_mixed_statuses_classify_per_taxonomy() {
    let (engine, store, api, log) = engine(RetryPolicy {
        max_retry: 2,
        retry_interval_secs: 60,
    });

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(create, ok(json!({"shipmentID": "S1"})));
    api.add_response(create, status(500, json!({"error": "server"})));
    api.add_response(create, status(400, json!({"error": "rejected"})));

    let mut batch = Batch::new(
        "CASE1_docs",
        vec![
            create_item(json!({"identifier": "r0"})),
            create_item(json!({"identifier": "r1"})),
            create_item(json!({"identifier": "r2"})),
        ],
        true,
    );
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert!(outcome.all_passed);
    assert!(outcome.is_retrying);
    assert_eq!(batch.retry_count, 1);
    assert_eq!(batch.responses.len(), 3);
    assert_eq!(batch.confirmation_numbers, vec!["S1".to_string()]);

    let messages = log.messages();
    assert!(messages.contains(&"Shipment-Create API call was partially successful (1/3)".to_string()));
    assert!(messages.contains(
        &"Shipment-Create API call was partially failed (2/3). Retrying in 60 seconds".to_string()
    ));
}

#[test_log::test(tokio::test)]
async fn fan_out_full_success_resets_retry_state() {
    let (engine, store, api, log) = engine(RetryPolicy {
        max_retry: 2,
        retry_interval_secs: 60,
    });

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(create, ok(json!({"shipmentID": "S1"})));
    api.add_response(create, ok(json!({"shipmentID": "S2"})));

    let mut batch = Batch::new(
        "CASE2_docs",
        vec![create_item(json!({})), create_item(json!({}))],
        true,
    );
    batch.retry_count = 1;
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert!(outcome.all_passed);
    assert!(!outcome.is_retrying);
    assert!(batch.all_resolved());
    assert_eq!(batch.retry_count, 0);
    assert_eq!(batch.confirmation_numbers.len(), 2);
    assert!(
        log.messages()
            .contains(&"Shipment-Create API call was successful (2/2)".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn all_200_state_resumes_with_zero_calls() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    let mut batch = Batch::new(
        "CASE3_docs",
        vec![create_item(json!({})), create_item(json!({}))],
        true,
    );
    batch
        .record_response(0, Some(200), json!({"shipmentID": "S1"}))
        .unwrap();
    batch
        .record_response(1, Some(200), json!({"shipmentID": "S2"}))
        .unwrap();
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert_eq!(api.call_count(), 0);
    assert!(outcome.all_passed);
    assert!(!outcome.is_retrying);
}

#[test_log::test(tokio::test)]
async fn resubmission_only_touches_unresolved_indices() {
    let (engine, store, api, _) = engine(RetryPolicy {
        max_retry: 3,
        retry_interval_secs: 1,
    });

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(create, ok(json!({"shipmentID": "S2"})));

    let mut batch = Batch::new(
        "CASE4_docs",
        vec![create_item(json!({})), create_item(json!({}))],
        true,
    );
    batch
        .record_response(0, Some(200), json!({"shipmentID": "S1"}))
        .unwrap();
    batch.record_response(1, Some(500), json!({})).unwrap();
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    // Index 0 short-circuited via its stored 200; only index 1 went out.
    assert_eq!(api.call_count(), 1);
    assert_eq!(batch.responses[0].body["shipmentID"], "S1");
    assert_eq!(batch.responses[1].body["shipmentID"], "S2");
    assert!(outcome.all_passed);
    assert!(!outcome.is_retrying);
}

#[test_log::test(tokio::test)]
async fn retry_budget_exhaustion_gives_up_and_resets() {
    let (engine, store, api, log) = engine(RetryPolicy {
        max_retry: 2,
        retry_interval_secs: 5,
    });

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    for _ in 0..3 {
        api.add_response(create, status(500, json!({"error": "down"})));
    }

    let mut batch = Batch::new("CASE5_docs", vec![create_item(json!({}))], true);
    save(&store, &batch).await;

    let first = engine.submit(&mut batch, &profile(false)).await.unwrap();
    assert!(first.is_retrying);
    assert_eq!(batch.retry_count, 1);

    let second = engine.submit(&mut batch, &profile(false)).await.unwrap();
    assert!(second.is_retrying);
    assert_eq!(batch.retry_count, 2);

    let third = engine.submit(&mut batch, &profile(false)).await.unwrap();
    assert!(!third.is_retrying);
    assert_eq!(batch.retry_count, 0);
    assert!(
        log.messages()
            .contains(&"Shipment-Create API call was failed (1/1)".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn status_url_switches_the_index_to_polling() {
    let (engine, store, api, _) = engine(RetryPolicy {
        max_retry: 3,
        retry_interval_secs: 1,
    });

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(
        create,
        status(202, json!({"statusURL": "https://partner/poll/7"})),
    );
    api.add_response(OperationKind::Poll, ok(json!({"shipmentID": "S1"})));

    let mut batch = Batch::new("CASE6_docs", vec![create_item(json!({}))], true);
    save(&store, &batch).await;

    let first = engine.submit(&mut batch, &profile(false)).await.unwrap();
    assert!(first.is_retrying);
    assert_eq!(batch.poll_url(0), Some("https://partner/poll/7"));

    let second = engine.submit(&mut batch, &profile(false)).await.unwrap();
    assert!(second.all_passed);

    let calls = api.get_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].operation, OperationKind::Poll);
    assert_eq!(calls[1].payload["statusURL"], "https://partner/poll/7");
}

#[test_log::test(tokio::test)]
async fn control_fields_never_reach_the_wire() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(create, ok(json!({"shipmentID": "S1"})));
    api.add_response(OperationKind::Timestamp, ok(json!({"ack": true})));

    let mut batch = Batch::new(
        "CASE7_docs",
        vec![create_item(json!({
            "housebillNumber": "HB1",
            "identifier": "r0",
            "batchid": "b-9",
            "milestone": [{"code": "DEP"}],
        }))],
        true,
    );
    save(&store, &batch).await;

    engine.submit(&mut batch, &profile(true)).await.unwrap();

    let sent = &api.get_calls()[0].payload;
    assert!(sent.get("identifier").is_none());
    assert!(sent.get("batchid").is_none());
    assert!(sent.get("milestone").is_none());
    assert_eq!(sent["housebillNumber"], "HB1");

    // The identifier comes back on the stored record for correlation.
    assert_eq!(batch.responses[0].body["identifier"], "r0");
}

#[test_log::test(tokio::test)]
async fn control_fields_are_stripped_without_timestamping_too() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    api.add_response(
        OperationKind::Submit(RequestType::ShipmentCreate),
        ok(json!({"shipmentID": "S1"})),
    );
    api.add_response(
        OperationKind::Submit(RequestType::Freight),
        ok(json!({"shipment": {"id": "FR-1"}})),
    );

    let mut fan_out = Batch::new(
        "CASE18_docs",
        vec![create_item(json!({
            "housebillNumber": "HB1",
            "identifier": "r0",
            "batchid": "b-1",
            "milestone": [{"code": "DEP"}],
        }))],
        true,
    );
    save(&store, &fan_out).await;
    engine.submit(&mut fan_out, &profile(false)).await.unwrap();

    let mut sequential = Batch::new(
        "CASE19_docs",
        vec![item_of(
            RequestType::Freight,
            json!({
                "lane": "A",
                "identifier": "r1",
                "batchid": "b-2",
                "milestone": [{"code": "ARR"}],
            }),
        )],
        false,
    );
    save(&store, &sequential).await;
    engine.submit(&mut sequential, &profile(false)).await.unwrap();

    for call in api.get_calls() {
        assert!(call.payload.get("identifier").is_none());
        assert!(call.payload.get("batchid").is_none());
        assert!(call.payload.get("milestone").is_none());
    }
    assert_eq!(api.call_count(), 2);
}

#[test_log::test(tokio::test)]
async fn milestones_of_a_failed_parent_never_hit_the_network() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    // Both items resolved from a prior round: index 0 succeeded, index 1 is
    // terminally rejected. The 400 re-dispatches and fails again.
    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(create, status(400, json!({"error": "rejected"})));
    api.add_response(OperationKind::Timestamp, ok(json!({"ack": true})));

    let mut batch = Batch::new(
        "CASE8_docs",
        vec![
            create_item(json!({"milestone": [{"code": "DEP"}]})),
            create_item(json!({"milestone": [{"code": "ARR"}]})),
        ],
        true,
    );
    batch
        .record_response(0, Some(200), json!({"shipmentID": "S1"}))
        .unwrap();
    batch.record_response(1, Some(400), json!({})).unwrap();
    save(&store, &batch).await;

    engine.submit(&mut batch, &profile(true)).await.unwrap();

    // One timestamp call for the healthy parent; the failed parent's
    // milestone is a derived failure recorded without any call.
    assert_eq!(api.call_count_for(OperationKind::Timestamp), 1);
    assert_eq!(batch.responses[0].timestamp_responses[0].status_code, Some(200));
    assert_eq!(batch.responses[1].timestamp_responses[0].status_code, None);
}

#[test_log::test(tokio::test)]
async fn milestone_rounds_stop_early_when_clean() {
    let (engine, store, api, log) = engine(RetryPolicy::default());

    let create = OperationKind::Submit(RequestType::ShipmentCreate);
    api.add_response(create, ok(json!({"shipmentID": "S1"})));
    api.add_response(OperationKind::Timestamp, status(500, json!({"err": 1})));
    api.add_response(OperationKind::Timestamp, ok(json!({"ack": true})));

    let mut batch = Batch::new(
        "CASE9_docs",
        vec![create_item(json!({"milestone": [{"code": "DEP"}]}))],
        true,
    );
    save(&store, &batch).await;

    engine.submit(&mut batch, &profile(true)).await.unwrap();

    // Round one fails, round two succeeds via the retry loop, rounds three
    // and four never run.
    assert_eq!(api.call_count_for(OperationKind::Timestamp), 2);
    assert_eq!(batch.responses[0].timestamp_responses[0].status_code, Some(200));

    let messages = log.messages();
    assert!(messages.contains(
        &"Time Stamp API call was failed. Attempting to retry (1/1)".to_string()
    ));
    assert!(messages.contains(&"Time Stamp API call was successful (1/1)".to_string()));
}

// ---------------------------------------------------------------------------
// Sequential mode
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn sequential_items_run_in_order_and_collect_confirmations() {
    let (engine, store, api, log) = engine(RetryPolicy::default());

    api.add_response(
        OperationKind::Submit(RequestType::Freight),
        ok(json!({"shipment": {"id": "FR-1"}})),
    );
    api.add_response(
        OperationKind::Submit(RequestType::Booking),
        ok(json!({"customsJobNumber": "CJ-7"})),
    );

    let mut batch = Batch::new(
        "CASE10_docs",
        vec![
            item_of(RequestType::Freight, json!({"lane": "A"})),
            item_of(RequestType::Booking, json!({"lane": "B"})),
        ],
        false,
    );
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert!(outcome.all_passed);
    assert!(!outcome.is_retrying);
    assert_eq!(
        batch.confirmation_numbers,
        vec!["FR-1".to_string(), "CJ-7".to_string()]
    );

    let messages = log.messages();
    assert!(messages.contains(&"Calling freight API to send payload".to_string()));
    assert!(messages.contains(&"Freight API call was successful".to_string()));
    assert!(messages.contains(&"Booking API call was successful".to_string()));
}

#[test_log::test(tokio::test)]
async fn sequential_breaks_on_first_terminal_failure() {
    let (engine, store, api, log) = engine(RetryPolicy::default());

    api.add_response(
        OperationKind::Submit(RequestType::Freight),
        status(500, json!({"error": "down"})),
    );

    let mut batch = Batch::new(
        "CASE11_docs",
        vec![
            item_of(RequestType::Freight, json!({})),
            item_of(RequestType::Booking, json!({})),
        ],
        false,
    );
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert!(!outcome.all_passed);
    assert!(!outcome.is_retrying);
    assert_eq!(api.call_count(), 1);
    assert_eq!(batch.responses.len(), 1);
    assert!(
        log.messages()
            .contains(&"Freight API call was failed with status 500".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn sequential_transient_failure_raises_the_retry_signal() {
    let (engine, store, api, log) = engine(RetryPolicy {
        max_retry: 2,
        retry_interval_secs: 30,
    });

    api.add_response(
        OperationKind::Submit(RequestType::Freight),
        status(503, json!({"error": "busy"})),
    );

    let mut batch = Batch::new(
        "CASE12_docs",
        vec![item_of(RequestType::Freight, json!({}))],
        false,
    );
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert!(outcome.is_retrying);
    assert_eq!(batch.retry_count, 1);
    assert!(log.messages().contains(
        &"Freight API call was failed with status 503. Retrying in 30 seconds".to_string()
    ));
}

#[test_log::test(tokio::test)]
async fn sequential_settled_non_create_items_are_skipped() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    let mut batch = Batch::new(
        "CASE13_docs",
        vec![item_of(RequestType::Freight, json!({}))],
        false,
    );
    batch
        .record_response(0, Some(200), json!({"shipment": {"id": "FR-1"}}))
        .unwrap();
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();

    assert_eq!(api.call_count(), 0);
    assert!(outcome.all_passed);
}

#[test_log::test(tokio::test)]
async fn sequential_create_runs_inline_timestamps() {
    let (engine, store, api, log) = engine(RetryPolicy::default());

    api.add_response(
        OperationKind::Submit(RequestType::ShipmentCreate),
        ok(json!({"shipmentID": "S1"})),
    );
    api.add_response(OperationKind::Timestamp, ok(json!({"ack": 1})));
    api.add_response(OperationKind::Timestamp, ok(json!({"ack": 2})));

    let mut batch = Batch::new(
        "CASE14_docs",
        vec![create_item(json!({
            "milestone": [{"code": "DEP"}, {"code": "ARR"}],
        }))],
        false,
    );
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(true)).await.unwrap();

    assert!(outcome.all_passed);
    assert_eq!(batch.responses[0].timestamp_responses.len(), 2);
    assert!(batch.responses[0].timestamp_responses.iter().all(|t| t.status_code == Some(200)));
    assert_eq!(batch.confirmation_numbers, vec!["S1".to_string()]);

    let timestamp_calls = api.call_count_for(OperationKind::Timestamp);
    assert_eq!(timestamp_calls, 2);
    assert!(
        log.messages()
            .contains(&"Time Stamp API call was successful".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn numeric_shipment_ids_feed_the_timestamp_stage() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    api.add_response(
        OperationKind::Submit(RequestType::ShipmentCreate),
        ok(json!({"shipmentID": 90210})),
    );
    api.add_response(OperationKind::Timestamp, ok(json!({"ack": 1})));

    let mut batch = Batch::new(
        "CASE20_docs",
        vec![create_item(json!({"milestone": [{"code": "DEP"}]}))],
        false,
    );
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(true)).await.unwrap();

    assert!(outcome.all_passed);
    assert_eq!(batch.responses[0].timestamp_responses[0].status_code, Some(200));
    assert_eq!(
        batch.responses[0].timestamp_responses[0].shipment_id.as_deref(),
        Some("90210")
    );
    assert_eq!(batch.confirmation_numbers, vec!["90210".to_string()]);

    let calls = api.get_calls();
    assert_eq!(calls[1].payload["shipment_id"], "90210");
}

#[test_log::test(tokio::test)]
async fn sequential_timestamp_resumption_skips_settled_milestones() {
    let (engine, store, api, _) = engine(RetryPolicy {
        max_retry: 3,
        retry_interval_secs: 1,
    });

    api.add_response(OperationKind::Timestamp, ok(json!({"ack": 2})));

    let mut batch = Batch::new(
        "CASE15_docs",
        vec![create_item(json!({
            "milestone": [{"code": "DEP"}, {"code": "ARR"}],
        }))],
        false,
    );
    batch
        .record_response(0, Some(200), json!({"shipmentID": "S1"}))
        .unwrap();
    batch.responses[0].timestamp_responses = vec![consign::MilestoneResult {
        status_code: Some(200),
        response_content: json!({"ack": 1}),
        milestone: json!({"code": "DEP"}),
        shipment_id: Some("S1".to_string()),
    }];
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(true)).await.unwrap();

    // The cached create short-circuits and only the second milestone is sent.
    assert_eq!(api.call_count(), 1);
    assert_eq!(api.call_count_for(OperationKind::Timestamp), 1);
    assert_eq!(batch.responses[0].timestamp_responses.len(), 2);
    assert!(outcome.all_passed);
}

#[test_log::test(tokio::test)]
async fn missing_confirmation_field_on_200_is_fatal() {
    let (engine, store, api, _) = engine(RetryPolicy::default());

    api.add_response(
        OperationKind::Submit(RequestType::Booking),
        ok(json!({"unexpected": true})),
    );

    let mut batch = Batch::new(
        "CASE16_docs",
        vec![item_of(RequestType::Booking, json!({}))],
        false,
    );
    save(&store, &batch).await;

    let err = engine.submit(&mut batch, &profile(false)).await.unwrap_err();
    assert!(matches!(
        err,
        ConsignError::MissingConfirmation { field: "customsJobNumber", .. }
    ));
}

#[test_log::test(tokio::test)]
async fn empty_batch_reports_nothing_to_do() {
    let (engine, store, _, _) = engine(RetryPolicy::default());

    let mut batch = Batch::new("CASE17_docs", vec![], true);
    save(&store, &batch).await;

    let outcome = engine.submit(&mut batch, &profile(false)).await.unwrap();
    assert!(!outcome.all_passed);
    assert!(!outcome.is_retrying);
}
