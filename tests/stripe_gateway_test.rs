use assert_matches::assert_matches;
use serde_json::json;
use storefront_api::{
    config::PaymentsConfig,
    errors::ServiceError,
    services::{
        payment_gateway::{
            CreateIntentRequest, ExternalPaymentStatus, ExternalRefundStatus, GatewayCustomer,
            PaymentGateway,
        },
        stripe_gateway::StripeGateway,
    },
};
use wiremock::{
    matchers::{body_string_contains, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn gateway_for(server: &MockServer) -> StripeGateway {
    let config = PaymentsConfig {
        provider: "stripe".into(),
        api_key: Some("sk_test_123".into()),
        api_base_url: format!("{}/v1", server.uri()),
        request_timeout_secs: 2,
        ..PaymentsConfig::default()
    };
    StripeGateway::new(&config).expect("gateway")
}

#[tokio::test]
async fn creates_intent_with_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(header("Idempotency-Key", "pay-1"))
        .and(body_string_contains("amount=2000"))
        .and(body_string_contains("currency=usd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_123",
            "status": "requires_payment_method",
            "client_secret": "pi_123_secret_abc"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let intent = gateway_for(&server)
        .create_intent(CreateIntentRequest {
            amount: 2000,
            currency: "USD".into(),
            idempotency_key: Some("pay-1".into()),
            ..CreateIntentRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(intent.external_id, "pi_123");
    assert_eq!(intent.client_secret, "pi_123_secret_abc");
    assert_eq!(intent.status, ExternalPaymentStatus::RequiresPaymentMethod);
}

#[tokio::test]
async fn minimum_amount_is_checked_before_calling_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = gateway_for(&server)
        .create_intent(CreateIntentRequest {
            amount: 10,
            currency: "usd".into(),
            ..CreateIntentRequest::default()
        })
        .await;
    assert_matches!(result, Err(ServiceError::AmountTooSmall { minimum: 50, .. }));
}

#[tokio::test]
async fn retrieves_intent_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payment_intents/pi_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_123",
            "status": "succeeded",
            "client_secret": null
        })))
        .mount(&server)
        .await;

    let status = gateway_for(&server).retrieve("pi_123").await.unwrap();
    assert_eq!(status, ExternalPaymentStatus::Succeeded);
}

#[tokio::test]
async fn provider_errors_become_gateway_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payment_intents/pi_missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "resource_missing", "message": "No such payment_intent" }
        })))
        .mount(&server)
        .await;

    let err = gateway_for(&server).retrieve("pi_missing").await.unwrap_err();
    assert!(err.is_retryable());
    assert_matches!(err, ServiceError::GatewayError { message } if message.contains("resource_missing"));
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_secs(5))
                .set_body_json(json!({ "id": "pi_1", "status": "succeeded" })),
        )
        .mount(&server)
        .await;

    let result = gateway_for(&server).retrieve("pi_1").await;
    assert_matches!(result, Err(ServiceError::GatewayError { message }) if message.contains("timed out"));
}

#[tokio::test]
async fn refunds_partial_amount() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .and(header("Idempotency-Key", "refund-1"))
        .and(body_string_contains("payment_intent=pi_123"))
        .and(body_string_contains("amount=500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "re_1",
            "status": "pending"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/refunds/re_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "re_1",
            "status": "succeeded"
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let refund = gateway
        .refund("pi_123", Some(500), Some("refund-1".into()))
        .await
        .unwrap();
    assert_eq!(refund.external_refund_id, "re_1");
    assert_eq!(refund.status, ExternalRefundStatus::Pending);

    let settled = gateway.retrieve_refund("re_1").await.unwrap();
    assert_eq!(settled, ExternalRefundStatus::Succeeded);
}

#[tokio::test]
async fn creates_customer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/customers"))
        .and(body_string_contains("email=buyer%40example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "cus_42" })))
        .mount(&server)
        .await;

    let id = gateway_for(&server)
        .create_customer(GatewayCustomer {
            email: "buyer@example.com".into(),
            name: Some("Buyer".into()),
            phone: None,
        })
        .await
        .unwrap();
    assert_eq!(id, "cus_42");
}
