use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::common::{total_pages, validate_input, PaginationParams};
use crate::{
    auth::AuthUser,
    entities::{
        order::{Model as OrderModel, OrderStatus},
        order_item::Model as OrderItemModel,
        refund::{Model as RefundModel, RefundStatus},
    },
    errors::ServiceError,
    services::{
        commerce::CartSource,
        orders::{CreateOrderInput, OrderWithItems, RefundItemRequest, RefundRequestInput},
    },
    ApiResponse, AppState, PaginatedResponse,
};

// Order DTOs
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    #[schema(value_type = String, example = "500.00")]
    pub unit_price: Decimal,
    #[schema(value_type = String, example = "1000.00")]
    pub line_total: Decimal,
}

impl From<OrderItemModel> for OrderItemResponse {
    fn from(item: OrderItemModel) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            variant_id: item.variant_id,
            sku: item.sku,
            name: item.name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_total: item.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    #[schema(example = "ORD-20240601-1A2B3C4D")]
    pub order_number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub tax_amount: Decimal,
    #[schema(value_type = String)]
    pub shipping_amount: Decimal,
    #[schema(value_type = String)]
    pub discount_amount: Decimal,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub shipping_address_id: Uuid,
    pub billing_address_id: Uuid,
    pub notes: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Omitted in list responses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderModel> for OrderResponse {
    fn from(order: OrderModel) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            user_id: order.user_id,
            status: order.status,
            currency: order.currency,
            subtotal: order.subtotal,
            tax_amount: order.tax_amount,
            shipping_amount: order.shipping_amount,
            discount_amount: order.discount_amount,
            total_amount: order.total_amount,
            shipping_address_id: order.shipping_address_id,
            billing_address_id: order.billing_address_id,
            notes: order.notes,
            delivered_at: order.delivered_at,
            items: Vec::new(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

impl From<OrderWithItems> for OrderResponse {
    fn from(value: OrderWithItems) -> Self {
        let mut response = OrderResponse::from(value.order);
        response.items = value.items.into_iter().map(Into::into).collect();
        response
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefundResponse {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub reason: String,
    pub status: RefundStatus,
    pub external_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<RefundModel> for RefundResponse {
    fn from(refund: RefundModel) -> Self {
        Self {
            id: refund.id,
            payment_id: refund.payment_id,
            order_id: refund.order_id,
            amount: refund.amount,
            currency: refund.currency,
            reason: refund.reason,
            status: refund.status,
            external_refund_id: refund.external_refund_id,
            created_at: refund.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
#[schema(example = json!({
    "cart": {
        "type": "draft",
        "currency": "USD",
        "lines": [{ "product_id": "550e8400-e29b-41d4-a716-446655440000", "quantity": 2 }]
    },
    "shipping_address_id": "660e8400-e29b-41d4-a716-446655440000"
}))]
pub struct CreateOrderRequest {
    pub cart: CartSource,
    pub shipping_address_id: Option<Uuid>,
    /// Defaults to the shipping address
    pub billing_address_id: Option<Uuid>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CancelOrderRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RefundOrderRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    /// Lines to refund; the whole remaining balance when omitted
    pub items: Option<Vec<RefundItemRequest>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RefundRequestResponse {
    pub order: OrderResponse,
    pub refund: RefundResponse,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/refund-request", post(request_refund))
        .route("/:id/status", post(update_order_status))
}

/// Create an order from a cart
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Snapshot the cart and create a PENDING order",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created successfully", body = ApiResponse<OrderResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Empty cart, invalid quantity, unavailable product or missing address", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), ServiceError> {
    validate_input(&request)?;

    let created = state
        .services
        .orders
        .create(
            auth_user.user_id,
            CreateOrderInput {
                cart: request.cart,
                shipping_address_id: request.shipping_address_id,
                billing_address_id: request.billing_address_id,
                discount: Decimal::ZERO,
                notes: request.notes,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(created.into()))))
}

/// List the caller's orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    params(PaginationParams),
    responses(
        (status = 200, description = "Orders retrieved successfully", body = ApiResponse<PaginatedResponse<OrderResponse>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderResponse>>>, ServiceError> {
    let (page, per_page) = params.normalized();
    let (orders, total) = state
        .services
        .orders
        .list_for_user(auth_user.user_id, page, per_page)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse {
        items: orders.into_iter().map(Into::into).collect(),
        total,
        page,
        limit: per_page,
        total_pages: total_pages(total, per_page),
    })))
}

/// Get an order with its items
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderResponse>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.services.orders.get(id, auth_user.owner_scope()).await?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// Cancel a PENDING or CONFIRMED order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel order",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body(content = CancelOrderRequest, description = "Optional cancellation reason"),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order cannot be cancelled in its current state", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    body: Option<Json<CancelOrderRequest>>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    validate_input(&request)?;

    let order = state
        .services
        .orders
        .cancel(id, auth_user.owner_scope(), request.reason)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// Request a refund for a delivered order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund-request",
    summary = "Request refund",
    description = "Refund a DELIVERED order inside the return window, fully or by line",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = RefundOrderRequest,
    responses(
        (status = 200, description = "Refund recorded", body = ApiResponse<RefundRequestResponse>),
        (status = 400, description = "Invalid items or amount exceeds refundable balance", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order or completed payment not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order not delivered or refund window expired", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider error", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn request_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<RefundOrderRequest>,
) -> Result<Json<ApiResponse<RefundRequestResponse>>, ServiceError> {
    validate_input(&request)?;

    let (order, refund) = state
        .services
        .orders
        .request_refund(
            id,
            auth_user.owner_scope(),
            RefundRequestInput {
                reason: request.reason,
                items: request.items,
            },
        )
        .await?;

    Ok(Json(ApiResponse::success(RefundRequestResponse {
        order: order.into(),
        refund: refund.into(),
    })))
}

/// Move an order along fulfillment (admin)
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/status",
    summary = "Advance order status",
    description = "Fulfillment transitions CONFIRMED -> PROCESSING -> SHIPPED -> DELIVERED",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderResponse>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Illegal transition", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    auth_user.require_admin()?;
    let order = state.services.orders.advance(id, request.status).await?;
    Ok(Json(ApiResponse::success(order.into())))
}
