mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::{Fixture, ScriptedGateway};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tower::ServiceExt;
use voucherpay::domain::ports::TransactionLedger;
use voucherpay::domain::{ProviderDetails, TransactionState};
use voucherpay::interfaces::http::build_router;

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let fx = Fixture::new(&[], ScriptedGateway::new()).await;
    let (status, body) = call(build_router(fx.engine.clone()), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "voucherpay");
}

#[tokio::test]
async fn test_initialize_returns_redirect() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    let payload = json!({
        "amount": 50,
        "payer_contact": "0712345678",
        "package_id": 1,
        "distribution_point_id": 10,
        "reseller_id": 7
    });

    let (status, body) = call(
        build_router(fx.engine.clone()),
        post_json("/payments", payload),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let reference = body["reference"].as_str().unwrap();
    assert_eq!(
        body["redirect_url"],
        format!("https://checkout.test/{reference}")
    );
    assert!(body.get("provider_transaction_id").is_none());

    let transactions = fx.engine.transactions().await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].state, TransactionState::Pending);
}

#[tokio::test]
async fn test_initialize_rejects_non_positive_amount() {
    let fx = Fixture::new(&[], ScriptedGateway::new()).await;
    let payload = json!({
        "amount": 0,
        "payer_contact": "0712345678",
        "package_id": 1,
        "distribution_point_id": 10,
        "reseller_id": 7
    });

    let (status, body) = call(
        build_router(fx.engine.clone()),
        post_json("/payments", payload),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);
    assert!(fx.engine.transactions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_settles_and_returns_voucher() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    fx.seed_pending("TXN1", dec!(50)).await;
    fx.gateway.settle("TXN1", dec!(50));

    let event = json!({ "event": "charge.success", "data": { "reference": "TXN1" } });
    let (status, body) = call(build_router(fx.engine.clone()), post_json("/confirm", event)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["voucher"]["code"], "V1");
    assert_eq!(body["voucher_backlog"], false);
}

fn stk_callback(checkout_request_id: &str, result_code: i64) -> Value {
    json!({
        "Body": { "stkCallback": {
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": checkout_request_id,
            "ResultCode": result_code,
            "ResultDesc": "The service request is processed successfully.",
            "CallbackMetadata": { "Item": [
                { "Name": "Amount", "Value": 50 },
                { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                { "Name": "PhoneNumber", "Value": 254712345678_u64 }
            ]}
        }}
    })
}

#[tokio::test]
async fn test_stk_callback_settles_by_checkout_request_id() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    let reference = fx.seed_pending("TXN1", dec!(50)).await;
    fx.ledger
        .record_provider_details(
            &reference,
            ProviderDetails {
                provider_transaction_id: Some("ws_CO_1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    fx.gateway.settle("TXN1", dec!(50));

    let (status, body) = call(
        build_router(fx.engine.clone()),
        post_json("/confirm", stk_callback("ws_CO_1", 0)),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reference"], "TXN1");
    assert_eq!(body["state"], "completed");
    assert_eq!(body["voucher"]["code"], "V1");
}

#[tokio::test]
async fn test_stk_callback_for_unknown_checkout_is_acknowledged() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    fx.seed_pending("TXN1", dec!(50)).await;

    let (status, body) = call(
        build_router(fx.engine.clone()),
        post_json("/confirm", stk_callback("ws_CO_404", 0)),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(fx.gateway.calls(), 0);
}

#[tokio::test]
async fn test_webhook_for_unknown_reference_is_acknowledged() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    let event = json!({ "event": "charge.success", "data": { "reference": "NOPE" } });

    let (status, body) = call(build_router(fx.engine.clone()), post_json("/confirm", event)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(fx.gateway.calls(), 0);
}

#[tokio::test]
async fn test_webhook_ignores_other_events() {
    let fx = Fixture::new(&[], ScriptedGateway::new()).await;
    let event = json!({ "event": "transfer.success", "data": { "reference": "TXN1" } });

    let (status, body) = call(build_router(fx.engine.clone()), post_json("/confirm", event)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_webhook_without_reference_is_bad_request() {
    let fx = Fixture::new(&[], ScriptedGateway::new()).await;
    let (status, _) = call(
        build_router(fx.engine.clone()),
        post_json("/confirm", json!({ "event": "charge.success", "data": {} })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_during_outage_asks_for_redelivery() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    let reference = fx.seed_pending("TXN1", dec!(50)).await;
    fx.gateway.outage("TXN1");

    let (status, body) = call(
        build_router(fx.engine.clone()),
        post_json("/confirm", json!({ "reference": "TXN1" })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["retryable"], true);
    assert_eq!(fx.transaction(&reference).await.state, TransactionState::Pending);
}

#[tokio::test]
async fn test_status_poll_during_outage_is_pending() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    fx.seed_pending("TXN1", dec!(50)).await;
    fx.gateway.outage("TXN1");

    let (status, body) = call(
        build_router(fx.engine.clone()),
        get("/status?reference=TXN1"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["retryable"], true);
    assert!(body.get("voucher").is_none());
}

#[tokio::test]
async fn test_status_reports_failure_reason() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    fx.seed_pending("TXN1", dec!(50)).await;
    fx.gateway.settle("TXN1", dec!(45));

    let (status, body) = call(
        build_router(fx.engine.clone()),
        get("/status?reference=TXN1"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "failed");
    assert_eq!(body["failure_reason"], "amount_mismatch");
}

#[tokio::test]
async fn test_recheck_unknown_reference_is_not_found() {
    let fx = Fixture::new(&[], ScriptedGateway::new()).await;
    let (status, body) = call(
        build_router(fx.engine.clone()),
        post_json("/recheck/NOPE", json!({})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_sweep_endpoint_reports_counts() {
    let fx = Fixture::new(&["V1"], ScriptedGateway::new()).await;
    fx.seed_pending("TXN1", dec!(50)).await;

    let (status, body) = call(build_router(fx.engine.clone()), post_json("/sweep", json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["still_pending"], 1);
    assert_eq!(body["expired"], 0);
}
