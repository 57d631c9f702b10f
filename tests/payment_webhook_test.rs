mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{
    handlers::payment_webhooks::sign_payload,
    services::payment_gateway::ExternalPaymentStatus,
};

const SECRET: &str = "whsec_integration";

/// PENDING order with an open intent; returns (order id, external id).
async fn order_with_intent(app: &TestApp) -> (String, String) {
    let product = app.seed_product("Notebook", dec!(12.00)).await;
    let address = app.seed_address().await;
    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cart": { "type": "draft", "lines": [{ "product_id": product.id, "quantity": 1 }] },
                "shipping_address_id": address.id
            })),
        )
        .await;
    let order_id = response_json(response).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/payments/intents",
            Some(json!({ "order_id": order_id, "amount": 1200, "currency": "USD" })),
        )
        .await;
    let external_id = response_json(response).await["data"]["external_id"]
        .as_str()
        .unwrap()
        .to_string();
    (order_id, external_id)
}

fn event(event_type: &str, external_id: &str, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": event_type,
        "data": { "object": { "id": external_id, "status": status } }
    }))
    .unwrap()
}

fn signed_headers(payload: &[u8]) -> Vec<(&'static str, String)> {
    let ts = Utc::now().timestamp();
    vec![
        ("x-timestamp", ts.to_string()),
        ("x-signature", sign_payload(SECRET, ts, payload).unwrap()),
    ]
}

async fn order_status(app: &TestApp, order_id: &str) -> String {
    let response = app
        .as_customer(Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    response_json(response).await["data"]["status"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn signed_success_confirms_order() {
    let app = TestApp::with_config(|cfg| cfg.payments.webhook_secret = Some(SECRET.into())).await;
    let (order_id, external_id) = order_with_intent(&app).await;

    let payload = event("payment_intent.succeeded", &external_id, "succeeded");
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &signed_headers(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(order_status(&app, &order_id).await, "CONFIRMED");

    // Redelivery is acknowledged without changing anything
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &signed_headers(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(order_status(&app, &order_id).await, "CONFIRMED");
}

#[tokio::test]
async fn signed_decline_fails_payment_but_keeps_order_payable() {
    let app = TestApp::with_config(|cfg| cfg.payments.webhook_secret = Some(SECRET.into())).await;
    let (order_id, external_id) = order_with_intent(&app).await;

    let payload = event("payment_intent.payment_failed", &external_id, "requires_payment_method");
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &signed_headers(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(order_status(&app, &order_id).await, "PENDING");

    let response = app
        .as_customer(Method::GET, &format!("/api/v1/payments/order/{}", order_id), None)
        .await;
    let body = response_json(response).await;
    assert_eq!(body["data"][0]["status"], "FAILED");
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let app = TestApp::with_config(|cfg| cfg.payments.webhook_secret = Some(SECRET.into())).await;
    let (order_id, external_id) = order_with_intent(&app).await;

    let payload = event("payment_intent.succeeded", &external_id, "succeeded");
    let ts = Utc::now().timestamp();
    let forged = vec![
        ("x-timestamp", ts.to_string()),
        ("x-signature", sign_payload("whsec_other", ts, &payload).unwrap()),
    ];
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &forged)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.post_raw("/api/v1/payments/webhook", payload, &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(order_status(&app, &order_id).await, "PENDING");
}

#[tokio::test]
async fn unsigned_payload_defers_to_gateway() {
    let app = TestApp::new().await;
    let (order_id, external_id) = order_with_intent(&app).await;
    app.gateway
        .set_intent_status(&external_id, ExternalPaymentStatus::Processing);

    // Claims success, but the gateway still reports processing
    let payload = event("payment_intent.succeeded", &external_id, "succeeded");
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(order_status(&app, &order_id).await, "PENDING");

    app.gateway
        .set_intent_status(&external_id, ExternalPaymentStatus::Succeeded);
    let response = app.post_raw("/api/v1/payments/webhook", payload, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(order_status(&app, &order_id).await, "CONFIRMED");
}

#[tokio::test]
async fn unknown_intents_and_other_events_are_acknowledged() {
    let app = TestApp::with_config(|cfg| cfg.payments.webhook_secret = Some(SECRET.into())).await;

    let payload = event("payment_intent.succeeded", "pi_not_ours", "succeeded");
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &signed_headers(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let payload = event("charge.dispute.created", "dp_1", "needs_response");
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &signed_headers(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let app = TestApp::with_config(|cfg| cfg.payments.webhook_secret = Some(SECRET.into())).await;
    let payload = b"not json".to_vec();
    let response = app
        .post_raw("/api/v1/payments/webhook", payload.clone(), &signed_headers(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
