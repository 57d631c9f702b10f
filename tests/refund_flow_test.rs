mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use storefront_api::services::{
    payment_gateway::{ExternalPaymentStatus, ExternalRefundStatus},
    reconciliation::ReconciliationPoller,
};

/// Walks an order for 2 x 10.00 + 1 x 5.00 through payment and delivery.
/// Returns the delivered order and the completed payment id.
async fn delivered_paid_order(app: &TestApp) -> (Value, String) {
    let tote = app.seed_product("Canvas Tote", dec!(10.00)).await;
    let pin = app.seed_product("Enamel Pin", dec!(5.00)).await;
    let address = app.seed_address().await;

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cart": {
                    "type": "draft",
                    "currency": "USD",
                    "lines": [
                        { "product_id": tote.id, "quantity": 2 },
                        { "product_id": pin.id, "quantity": 1 }
                    ]
                },
                "shipping_address_id": address.id
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let order = response_json(response).await["data"].clone();
    let order_id = order["id"].as_str().unwrap().to_string();

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/payments/intents",
            Some(json!({ "order_id": order_id, "amount": 2500, "currency": "USD" })),
        )
        .await;
    let intent = response_json(response).await["data"].clone();
    let external_id = intent["external_id"].as_str().unwrap();
    app.gateway
        .set_intent_status(external_id, ExternalPaymentStatus::Succeeded);

    let response = app
        .as_customer(
            Method::POST,
            "/api/v1/payments/confirm",
            Some(json!({ "external_id": external_id })),
        )
        .await;
    assert_eq!(response_json(response).await["data"]["order_status"], "CONFIRMED");

    for status in ["PROCESSING", "SHIPPED", "DELIVERED"] {
        let response = app
            .as_admin(
                Method::POST,
                &format!("/api/v1/orders/{}/status", order_id),
                Some(json!({ "status": status })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "advance to {}", status);
    }

    let response = app
        .as_customer(Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    let order = response_json(response).await["data"].clone();
    assert_eq!(order["status"], "DELIVERED");
    assert!(order["delivered_at"].is_string());

    (order, intent["payment_id"].as_str().unwrap().to_string())
}

async fn payment_status(app: &TestApp, order_id: &str) -> Value {
    let response = app
        .as_customer(Method::GET, &format!("/api/v1/payments/order/{}", order_id), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    response_json(response).await["data"][0]["status"].clone()
}

#[tokio::test]
async fn full_refund_marks_order_and_payment_refunded() {
    let app = TestApp::new().await;
    let (order, _) = delivered_paid_order(&app).await;
    let order_id = order["id"].as_str().unwrap();

    let response = app
        .as_customer(
            Method::POST,
            &format!("/api/v1/orders/{}/refund-request", order_id),
            Some(json!({ "reason": "arrived damaged" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["refund"]["amount"], 2500);
    assert_eq!(body["data"]["refund"]["status"], "COMPLETED");
    assert_eq!(body["data"]["order"]["status"], "REFUNDED");
    assert!(body["data"]["order"]["notes"]
        .as_str()
        .unwrap()
        .contains("arrived damaged"));

    assert_eq!(payment_status(&app, order_id).await, "REFUNDED");
}

#[tokio::test]
async fn partial_refund_by_item_then_over_refund_is_rejected() {
    let app = TestApp::new().await;
    let (order, payment_id) = delivered_paid_order(&app).await;
    let order_id = order["id"].as_str().unwrap();
    let pin_item = order["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|item| item["quantity"] == 1)
        .expect("pin line")
        .clone();

    let response = app
        .as_customer(
            Method::POST,
            &format!("/api/v1/orders/{}/refund-request", order_id),
            Some(json!({
                "reason": "pin missing",
                "items": [{ "order_item_id": pin_item["id"], "quantity": 1 }]
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["refund"]["amount"], 500);
    assert_eq!(body["data"]["order"]["status"], "DELIVERED");
    assert_eq!(payment_status(&app, order_id).await, "COMPLETED");

    let response = app
        .as_admin(
            Method::POST,
            &format!("/api/v1/payments/{}/refunds", payment_id),
            Some(json!({ "amount": 2500, "reason": "goodwill" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["code"], "refund_exceeds_payment");
    assert_eq!(body["details"]["refundable"], 2000);

    // The remainder closes out the payment
    let response = app
        .as_admin(
            Method::POST,
            &format!("/api/v1/payments/{}/refunds", payment_id),
            Some(json!({ "reason": "goodwill" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response_json(response).await["data"]["amount"], 2000);
    assert_eq!(payment_status(&app, order_id).await, "REFUNDED");

    let response = app
        .as_admin(
            Method::GET,
            &format!("/api/v1/payments/{}/refunds", payment_id),
            None,
        )
        .await;
    assert_eq!(response_json(response).await["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn refund_window_expires_after_thirty_days() {
    let app = TestApp::new().await;
    let (order, _) = app.seed_delivered_order(45, &[(dec!(25.00), 1)]).await;

    let response = app
        .as_customer(
            Method::POST,
            &format!("/api/v1/orders/{}/refund-request", order.id),
            Some(json!({ "reason": "too late" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = response_json(response).await;
    assert_eq!(body["code"], "refund_window_expired");
    assert_eq!(body["details"]["days_since_delivery"], 45);
    assert_eq!(body["details"]["window_days"], 30);
}

#[tokio::test]
async fn refund_requires_a_delivered_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("Canvas Tote", dec!(10.00)).await;
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
    let order = response_json(response).await["data"].clone();

    let response = app
        .as_customer(
            Method::POST,
            &format!("/api/v1/orders/{}/refund-request", order["id"].as_str().unwrap()),
            Some(json!({ "reason": "never arrived" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = response_json(response).await;
    assert_eq!(body["code"], "order_not_delivered");
    assert_eq!(body["details"]["current_status"], "PENDING");
}

#[tokio::test]
async fn confirmed_payment_cannot_be_refunded_before_delivery() {
    let app = TestApp::new().await;
    let product = app.seed_product("Canvas Tote", dec!(10.00)).await;
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
            Some(json!({ "order_id": order_id, "amount": 1000, "currency": "USD" })),
        )
        .await;
    let intent = response_json(response).await["data"].clone();
    let external_id = intent["external_id"].as_str().unwrap();
    app.gateway
        .set_intent_status(external_id, ExternalPaymentStatus::Succeeded);
    app.as_customer(
        Method::POST,
        "/api/v1/payments/confirm",
        Some(json!({ "external_id": external_id })),
    )
    .await;

    let payment_id = intent["payment_id"].as_str().unwrap();
    let response = app
        .as_admin(
            Method::POST,
            &format!("/api/v1/payments/{}/refunds", payment_id),
            Some(json!({ "reason": "goodwill" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = response_json(response).await;
    assert_eq!(body["code"], "order_not_delivered");
    assert_eq!(body["details"]["current_status"], "CONFIRMED");

    assert_eq!(payment_status(&app, &order_id).await, "COMPLETED");
    let response = app
        .as_customer(Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    assert_eq!(response_json(response).await["data"]["status"], "CONFIRMED");
}

#[tokio::test]
async fn rejected_gateway_refund_records_nothing() {
    let app = TestApp::new().await;
    let (order, payment_id) = delivered_paid_order(&app).await;
    app.gateway.set_refund_outcome(ExternalRefundStatus::Failed);

    let response = app
        .as_customer(
            Method::POST,
            &format!("/api/v1/orders/{}/refund-request", order["id"].as_str().unwrap()),
            Some(json!({ "reason": "arrived damaged" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = app
        .as_admin(
            Method::GET,
            &format!("/api/v1/payments/{}/refunds", payment_id),
            None,
        )
        .await;
    assert!(response_json(response).await["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn pending_refund_is_settled_by_poller() {
    let app = TestApp::new().await;
    let (order, _) = delivered_paid_order(&app).await;
    let order_id = order["id"].as_str().unwrap();
    app.gateway.set_refund_outcome(ExternalRefundStatus::Pending);

    let response = app
        .as_customer(
            Method::POST,
            &format!("/api/v1/orders/{}/refund-request", order_id),
            Some(json!({ "reason": "arrived damaged" })),
        )
        .await;
    let body = response_json(response).await;
    assert_eq!(body["data"]["refund"]["status"], "PENDING");
    assert_eq!(body["data"]["order"]["status"], "DELIVERED");
    let external_refund_id = body["data"]["refund"]["external_refund_id"]
        .as_str()
        .unwrap()
        .to_string();

    app.gateway
        .settle_refund(&external_refund_id, ExternalRefundStatus::Succeeded);
    let poller = ReconciliationPoller::new(
        app.state.services.payments.clone(),
        app.state.services.refunds.clone(),
        &app.state.config.payments,
    );
    let report = poller.run_once().await.expect("poll pass");
    assert_eq!(report.refunds_checked, 1);
    assert_eq!(report.refunds_settled, 1);
    assert_eq!(report.failures, 0);

    assert_eq!(payment_status(&app, order_id).await, "REFUNDED");
    let response = app
        .as_customer(Method::GET, &format!("/api/v1/orders/{}", order_id), None)
        .await;
    assert_eq!(response_json(response).await["data"]["status"], "REFUNDED");
}
