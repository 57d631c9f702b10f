use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "code": "order_not_cancellable",
    "message": "order cannot be cancelled in its current state: SHIPPED",
    "details": { "current_status": "SHIPPED" },
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status reason (e.g. "Not Found", "Conflict")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Structured context such as the current order status
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

/// Closed set of failure kinds a caller has to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input; never retried automatically.
    Validation,
    /// The order or payment is in a state that forbids the operation.
    StateConflict,
    NotFound,
    /// The payment provider failed; safe to retry.
    External,
    Auth,
    Internal,
}

#[derive(Debug, thiserror::Error, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: Uuid, quantity: i32 },

    #[error("product {product_id} is not available")]
    ProductUnavailable {
        product_id: Uuid,
        variant_id: Option<Uuid>,
    },

    #[error("a shipping address is required")]
    AddressRequired,

    #[error("amount {amount} is below the minimum of {minimum} for {currency}")]
    AmountTooSmall {
        amount: i64,
        minimum: i64,
        currency: String,
    },

    #[error("amount {amount} does not match the order total of {expected} {currency}")]
    AmountMismatch {
        amount: i64,
        expected: i64,
        currency: String,
    },

    #[error("illegal order transition from {current} to {requested}")]
    IllegalTransition {
        current: OrderStatus,
        requested: OrderStatus,
    },

    #[error("order cannot be cancelled in its current state: {current}")]
    OrderNotCancellable { current: OrderStatus },

    #[error("order has not been delivered, current state: {current}")]
    OrderNotDelivered { current: OrderStatus },

    #[error("refund window expired: order was delivered {days_since_delivery} days ago (limit {window_days})")]
    RefundWindowExpired {
        days_since_delivery: i64,
        window_days: i64,
    },

    #[error("order is not awaiting payment, current state: {current}")]
    OrderNotPending { current: OrderStatus },

    #[error("a different payment is already in progress for order {order_id}")]
    PaymentInProgress { order_id: Uuid, payment_id: Uuid },

    #[error("refund of {requested} exceeds the refundable balance of {refundable}")]
    RefundExceedsPayment { requested: i64, refundable: i64 },

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    #[error("payment {0} was not processed through the payment gateway")]
    NotGatewayProcessed(Uuid),

    #[error("payment gateway error: {message}")]
    GatewayError { message: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn gateway(message: impl Into<String>) -> Self {
        ServiceError::GatewayError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyCart
            | Self::InvalidQuantity { .. }
            | Self::ProductUnavailable { .. }
            | Self::AddressRequired
            | Self::AmountTooSmall { .. }
            | Self::AmountMismatch { .. }
            | Self::RefundExceedsPayment { .. }
            | Self::ValidationError(_)
            | Self::BadRequest(_) => ErrorCategory::Validation,
            Self::IllegalTransition { .. }
            | Self::OrderNotCancellable { .. }
            | Self::OrderNotDelivered { .. }
            | Self::RefundWindowExpired { .. }
            | Self::OrderNotPending { .. }
            | Self::PaymentInProgress { .. }
            | Self::NotGatewayProcessed(_) => ErrorCategory::StateConflict,
            Self::OrderNotFound(_) | Self::PaymentNotFound(_) => ErrorCategory::NotFound,
            Self::GatewayError { .. } => ErrorCategory::External,
            Self::Unauthorized(_) | Self::Forbidden(_) => ErrorCategory::Auth,
            Self::DatabaseError(_) | Self::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Gateway failures are the only errors a caller may blindly retry.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::External
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::StateConflict => StatusCode::CONFLICT,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::External => StatusCode::BAD_GATEWAY,
            ErrorCategory::Auth => match self {
                Self::Forbidden(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::UNAUTHORIZED,
            },
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        self.into()
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal and gateway errors return generic messages to avoid leaking details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            Self::GatewayError { .. } => "payment provider error, please retry".to_string(),
            _ => self.to_string(),
        }
    }

    /// Machine-readable state attached to conflict errors.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::IllegalTransition { current, requested } => Some(json!({
                "current_status": current,
                "requested_status": requested,
            })),
            Self::OrderNotCancellable { current }
            | Self::OrderNotDelivered { current }
            | Self::OrderNotPending { current } => Some(json!({ "current_status": current })),
            Self::RefundWindowExpired {
                days_since_delivery,
                window_days,
            } => Some(json!({
                "days_since_delivery": days_since_delivery,
                "window_days": window_days,
            })),
            Self::PaymentInProgress {
                order_id,
                payment_id,
            } => Some(json!({ "order_id": order_id, "payment_id": payment_id })),
            Self::RefundExceedsPayment {
                requested,
                refundable,
            } => Some(json!({ "requested": requested, "refundable": refundable })),
            Self::AmountTooSmall {
                minimum, currency, ..
            } => Some(json!({ "minimum": minimum, "currency": currency })),
            Self::AmountMismatch {
                expected, currency, ..
            } => Some(json!({ "expected": expected, "currency": currency })),
            Self::GatewayError { .. } => Some(json!({ "retryable": true })),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
