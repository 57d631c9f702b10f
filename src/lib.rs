//! Storefront order and payment lifecycle service.
//!
//! Carts are snapshotted into PENDING orders, paid through an external
//! gateway, reconciled from client reports, webhooks and a poller, and
//! refunded after delivery.

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

#[cfg(test)]
mod test_support;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{auth::JwtVerifier, events::EventSender, services::payment_gateway::PaymentGateway};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<EventSender>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub services: handlers::AppServices,
    pub jwt: JwtVerifier,
}

impl AppState {
    /// Wires services around the given connection and gateway.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let services =
            handlers::AppServices::new(db.clone(), event_sender.clone(), gateway.clone(), &config);
        let jwt = JwtVerifier::new(&config.jwt_secret, &config.auth_issuer, &config.auth_audience);
        Self {
            db,
            config,
            event_sender,
            gateway,
            services,
            jwt,
        }
    }
}

// Common response wrappers
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    // Payment webhook (does not require auth, but signature-verified)
    let payment_webhook = Router::new().route(
        "/payments/webhook",
        axum::routing::post(handlers::payment_webhooks::payment_webhook),
    );

    Router::new()
        .route("/health", get(health_check))
        .nest("/orders", handlers::orders::order_routes())
        .merge(payment_webhook)
        .nest("/payments", handlers::payments::payment_routes())
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub database: String,
    pub payment_gateway: String,
    pub version: String,
    pub timestamp: String,
}

/// Liveness plus database connectivity
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service healthy", body = ApiResponse<HealthStatus>),
        (status = 503, description = "Database unreachable", body = ApiResponse<HealthStatus>),
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthStatus>>) {
    let db_ok = db::check_connection(&state.db).await.is_ok();
    let health = HealthStatus {
        status: if db_ok { "healthy" } else { "unhealthy" }.to_string(),
        database: if db_ok { "up" } else { "down" }.to_string(),
        payment_gateway: state.gateway.name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    };
    if !db_ok {
        ::tracing::warn!("Health check failed: database unreachable");
    }
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ApiResponse::success(health)))
}
