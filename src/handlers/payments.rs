use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::{common::validate_input, orders::RefundResponse};
use crate::{
    auth::AuthUser,
    entities::payment::{Model as PaymentModel, PaymentStatus},
    errors::ServiceError,
    services::payments::{CreateIntentInput, PaymentIntentHandle, ReconciliationOutcome},
    ApiResponse, AppState,
};

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
#[schema(example = json!({
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "amount": 1000,
    "currency": "USD"
}))]
pub struct CreatePaymentIntentRequest {
    pub order_id: Uuid,
    /// Amount in minor currency units (cents)
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfirmPaymentRequest {
    /// Gateway payment-intent id
    #[validate(length(min = 1, max = 255))]
    pub external_id: String,
    /// Status the client saw, e.g. "succeeded". Verified against the
    /// gateway unless verification is disabled.
    pub reported_status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RefundPaymentRequest {
    /// Minor currency units; the remaining balance when omitted
    #[validate(range(min = 1))]
    pub amount: Option<i64>,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway: String,
    pub external_id: Option<String>,
    /// Raw status last reported by the gateway
    pub last_gateway_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentModel> for PaymentResponse {
    fn from(payment: PaymentModel) -> Self {
        let metadata = payment.metadata();
        Self {
            id: payment.id,
            order_id: payment.order_id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            gateway: payment.gateway,
            external_id: payment.gateway_intent_id,
            last_gateway_status: metadata.last_status,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/intents", post(create_payment_intent))
        .route("/confirm", post(confirm_payment))
        .route("/order/:order_id", get(get_order_payments))
        .route("/:payment_id/refunds", post(refund_payment).get(list_payment_refunds))
}

/// Open a payment intent for a PENDING order
#[utoipa::path(
    post,
    path = "/api/v1/payments/intents",
    summary = "Create payment intent",
    request_body = CreatePaymentIntentRequest,
    responses(
        (status = 201, description = "Intent created", body = ApiResponse<PaymentIntentHandle>),
        (status = 200, description = "In-flight intent for the same amount returned", body = ApiResponse<PaymentIntentHandle>),
        (status = 400, description = "Amount below the gateway minimum or currency mismatch", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order not pending or another payment in progress", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider error", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CreatePaymentIntentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentIntentHandle>>), ServiceError> {
    validate_input(&request)?;

    let handle = state
        .services
        .payments
        .create_intent(
            auth_user.owner_scope(),
            CreateIntentInput {
                order_id: request.order_id,
                amount: request.amount,
                currency: request.currency,
            },
        )
        .await?;

    let status = if handle.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(handle))))
}

/// Report a payment outcome seen by the client
#[utoipa::path(
    post,
    path = "/api/v1/payments/confirm",
    summary = "Confirm payment",
    description = "Reconcile a payment intent. Repeated calls return the current statuses.",
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 200, description = "Payment reconciled", body = ApiResponse<ReconciliationOutcome>),
        (status = 404, description = "Unknown payment intent", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider error", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<ApiResponse<ReconciliationOutcome>>, ServiceError> {
    validate_input(&request)?;

    let outcome = state
        .services
        .payments
        .confirm_reported(
            auth_user.owner_scope(),
            &request.external_id,
            request.reported_status.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// List payment attempts for an order
#[utoipa::path(
    get,
    path = "/api/v1/payments/order/{order_id}",
    summary = "List order payments",
    params(("order_id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payments for the order", body = ApiResponse<Vec<PaymentResponse>>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn get_order_payments(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<Vec<PaymentResponse>>>, ServiceError> {
    let payments = state
        .services
        .payments
        .list_for_order(order_id, auth_user.owner_scope())
        .await?;
    Ok(Json(ApiResponse::success(
        payments.into_iter().map(Into::into).collect(),
    )))
}

/// Refund a completed payment (admin)
#[utoipa::path(
    post,
    path = "/api/v1/payments/{payment_id}/refunds",
    summary = "Refund payment",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    request_body = RefundPaymentRequest,
    responses(
        (status = 201, description = "Refund recorded", body = ApiResponse<RefundResponse>),
        (status = 400, description = "Amount exceeds the refundable balance", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Completed payment not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Payment was not processed through the gateway", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider error", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<RefundPaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RefundResponse>>), ServiceError> {
    auth_user.require_admin()?;
    validate_input(&request)?;

    let refund = state
        .services
        .refunds
        .refund(payment_id, request.amount, request.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(refund.into()))))
}

/// List refunds recorded against a payment (admin)
#[utoipa::path(
    get,
    path = "/api/v1/payments/{payment_id}/refunds",
    summary = "List payment refunds",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Refunds for the payment", body = ApiResponse<Vec<RefundResponse>>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn list_payment_refunds(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<Vec<RefundResponse>>>, ServiceError> {
    auth_user.require_admin()?;
    let refunds = state.services.refunds.list_for_payment(payment_id).await?;
    Ok(Json(ApiResponse::success(
        refunds.into_iter().map(Into::into).collect(),
    )))
}
