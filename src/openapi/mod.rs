use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

/// Registers the bearer scheme referenced by `security(("Bearer" = []))`.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme("Bearer", SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)));
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = r#"
# Storefront Order and Payment API

Checkout, payment and refund lifecycle for the storefront.

## Flow

1. `POST /orders` snapshots the cart and creates a `PENDING` order.
2. `POST /payments/intents` opens a gateway payment intent and returns its client secret.
3. The payer completes payment with the gateway.
4. `POST /payments/confirm`, the gateway webhook or the background poller reconcile the outcome.
   Repeated reports are no-ops that return the current statuses.
5. Delivered orders can be refunded within the return window via `POST /orders/{id}/refund-request`.

## Authentication

Endpoints require a bearer JWT issued by the identity provider:

```
Authorization: Bearer <your-jwt-token>
```

## Errors

Failures use one body shape. `code` is machine-readable, and state conflicts carry the
current status in `details`:

```json
{
  "error": "Conflict",
  "code": "order_not_cancellable",
  "message": "order cannot be cancelled in its current state: SHIPPED",
  "details": { "current_status": "SHIPPED" },
  "timestamp": "2024-01-01T00:00:00Z"
}
```

Payment provider failures return `502` with a generic message and are safe to retry.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Order lifecycle endpoints"),
        (name = "Payments", description = "Payment intents, reconciliation and refunds"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::request_refund,
        crate::handlers::orders::update_order_status,

        // Payments
        crate::handlers::payments::create_payment_intent,
        crate::handlers::payments::confirm_payment,
        crate::handlers::payments::get_order_payments,
        crate::handlers::payments::refund_payment,
        crate::handlers::payments::list_payment_refunds,

        // Webhooks
        crate::handlers::payment_webhooks::payment_webhook,

        crate::health_check,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::services::commerce::CartSource,
            crate::services::commerce::DraftCart,
            crate::services::commerce::DraftCartLine,
            crate::entities::order::OrderStatus,
            crate::entities::payment::PaymentStatus,
            crate::entities::refund::RefundStatus,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
