//! Metering front-end integration tests.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{chat_reply, test_config, TestHarness, UpstreamBehavior, USER};
use zg_broker_core::{SettlementState, UsageFilter};
use zg_broker_service::ServiceType;
use zg_broker_store::Store;

async fn live_records(harness: &TestHarness) -> Vec<zg_broker_core::UsageRecord> {
    harness.store.list_usage(&UsageFilter::default()).await.unwrap()
}

// ============================================================================
// Successful Metering
// ============================================================================

#[tokio::test]
async fn delivered_request_is_recorded() {
    let harness = TestHarness::new();
    harness.upstream.set(chat_reply("four words of output"));

    let response = harness.chat_request(1, "hello big world").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "four words of output");

    let records = live_records(&harness).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.user.to_string(), USER);
    assert_eq!(record.route, "/chat/completions");
    assert_eq!(record.nonce, 1);
    assert_eq!(record.input_count, 3);
    assert_eq!(record.output_count, 4);
    assert_eq!(record.output_fee, 4);
    assert_eq!(record.state, SettlementState::Pending);
    assert!(record.delivered_at.is_some());

    let forwarded = harness.upstream.requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].route, "/chat/completions");
}

#[tokio::test]
async fn image_generation_counts_one_input() {
    let mut config = test_config();
    config.service_type = ServiceType::ImageGeneration;
    config.billable_routes = vec!["/images/generations".into()];
    let harness = TestHarness::with_config(config);
    harness.upstream.set(UpstreamBehavior::Reply {
        status: StatusCode::OK,
        content_type: "image/png",
        body: vec![0x89, b'P', b'N', b'G'],
    });

    let response = harness
        .server
        .post("/v1/proxy/images/generations")
        .add_header("Address", USER)
        .add_header("Fee", "1")
        .add_header("Input-Fee", "1")
        .add_header("Nonce", "1")
        .add_header("Request-Hash", "0xabcd")
        .add_header("Signature", "[1,2,3]")
        .add_header("Use-Proxy", "true")
        .json(&json!({ "prompt": "a lighthouse at dusk" }))
        .await;

    response.assert_status_ok();
    let records = live_records(&harness).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].input_count, 1);
    assert_eq!(records[0].output_count, 0);
}

// ============================================================================
// Rejected Requests
// ============================================================================

#[tokio::test]
async fn missing_header_is_rejected_before_metering() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/proxy/chat/completions")
        .add_header("Address", USER)
        .add_header("Fee", "3")
        .add_header("Input-Fee", "3")
        .add_header("Request-Hash", "0xabcd")
        .add_header("Signature", "[1,2,3]")
        .add_header("Use-Proxy", "false")
        .json(&json!({ "messages": [{ "role": "user", "content": "hello big world" }] }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "invalid_metadata");
    assert_eq!(body["error"]["details"]["header"], "Nonce");

    assert!(live_records(&harness).await.is_empty());
    assert!(harness.upstream.requests().is_empty());
}

#[tokio::test]
async fn underpaid_input_is_rejected() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/proxy/chat/completions")
        .add_header("Address", USER)
        .add_header("Fee", "2")
        .add_header("Input-Fee", "2")
        .add_header("Nonce", "1")
        .add_header("Request-Hash", "0xabcd")
        .add_header("Signature", "[1,2,3]")
        .add_header("Use-Proxy", "false")
        .json(&json!({ "messages": [{ "role": "user", "content": "hello big world" }] }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["details"]["header"], "Input-Fee");
    assert!(live_records(&harness).await.is_empty());
}

#[tokio::test]
async fn nonce_replay_is_a_conflict() {
    let harness = TestHarness::new();

    harness.chat_request(5, "first call").await.assert_status_ok();
    let replay = harness.chat_request(5, "second call").await;
    let older = harness.chat_request(4, "third call").await;

    replay.assert_status(StatusCode::CONFLICT);
    older.assert_status(StatusCode::CONFLICT);
    assert_eq!(live_records(&harness).await.len(), 1);
    assert_eq!(harness.upstream.requests().len(), 1);
}

#[tokio::test]
async fn unknown_route_is_not_metered() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/proxy/embeddings")
        .add_header("Address", USER)
        .add_header("Fee", "1")
        .add_header("Input-Fee", "1")
        .add_header("Nonce", "1")
        .add_header("Request-Hash", "0xabcd")
        .add_header("Signature", "[1,2,3]")
        .add_header("Use-Proxy", "false")
        .json(&json!({ "input": "hello" }))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
    assert!(live_records(&harness).await.is_empty());
    assert!(harness.upstream.requests().is_empty());
}

#[tokio::test]
async fn headers_are_checked_before_the_route() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/proxy/embeddings")
        .add_header("Address", USER)
        .json(&json!({ "input": "hello" }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "invalid_metadata");
    assert!(harness.upstream.requests().is_empty());
}

#[tokio::test]
async fn unregistered_user_is_refused() {
    let harness = TestHarness::new();
    harness.ledger.unregister(&harness.user);

    let response = harness.chat_request(1, "hello big world").await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "invalid_metadata");
    assert_eq!(body["error"]["details"]["header"], "Address");
    assert!(live_records(&harness).await.is_empty());
    assert!(harness.upstream.requests().is_empty());
}

#[tokio::test]
async fn overdrawn_user_is_refused() {
    let harness = TestHarness::new();
    harness.ledger.set_balance(&harness.user, 4);

    // Input fee 3 fits; delivery adds 4 of output.
    harness.chat_request(1, "hello big world").await.assert_status_ok();
    let records = live_records(&harness).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fee, 7);

    // 2 more on top of the 7 still unsettled is over the balance.
    let response = harness.chat_request(2, "one two").await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "insufficient_balance");
    assert_eq!(body["error"]["details"]["balance"], "4");
    assert_eq!(body["error"]["details"]["required"], "9");
    assert_eq!(live_records(&harness).await.len(), 1);
    assert_eq!(harness.upstream.requests().len(), 1);

    harness.ledger.set_balance(&harness.user, 9);
    harness.chat_request(2, "one two").await.assert_status_ok();
}

// ============================================================================
// Upstream Failures
// ============================================================================

#[tokio::test]
async fn unreachable_upstream_discards_record() {
    let harness = TestHarness::new();
    harness.upstream.set(UpstreamBehavior::Unreachable);

    let response = harness.chat_request(1, "hello big world").await;

    response.assert_status(StatusCode::BAD_GATEWAY);
    assert!(live_records(&harness).await.is_empty());

    let all = harness
        .store
        .list_usage(&UsageFilter {
            include_deleted: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].deleted_at.is_some());

    // The discarded record still holds its nonce.
    harness.upstream.set(chat_reply("ok"));
    harness
        .chat_request(1, "hello big world")
        .await
        .assert_status(StatusCode::CONFLICT);
    harness.chat_request(2, "hello big world").await.assert_status_ok();
}

#[tokio::test]
async fn upstream_error_status_is_relayed_and_not_billed() {
    let harness = TestHarness::new();
    harness.upstream.set(UpstreamBehavior::Reply {
        status: StatusCode::SERVICE_UNAVAILABLE,
        content_type: "application/json",
        body: br#"{"error":"model loading"}"#.to_vec(),
    });

    let response = harness.chat_request(1, "hello big world").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "model loading");
    assert!(live_records(&harness).await.is_empty());
}

// ============================================================================
// Usage Listing
// ============================================================================

#[tokio::test]
async fn usage_listing_reports_total_fee() {
    let harness = TestHarness::new();
    harness.chat_request(1, "one two").await.assert_status_ok();
    harness.chat_request(2, "one two three").await.assert_status_ok();

    let response = harness
        .server
        .get("/v1/usage")
        .add_query_param("state", "pending")
        .add_query_param("user", USER)
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["count"], 2);
    assert_eq!(body["total_fee"], "5");
    assert_eq!(body["records"][0]["nonce"], 1);
    assert_eq!(body["records"][0]["fee"], "2");
    assert_eq!(body["records"][1]["state"], "pending");
}

#[tokio::test]
async fn usage_listing_rejects_unknown_state() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/usage")
        .add_query_param("state", "paid")
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}
