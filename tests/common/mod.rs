#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set};
use serde_json::Value;
use storefront_api::{
    auth::Claims,
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        commerce::{customer, customer_address, product, product_variant},
        order::{self, OrderStatus},
        order_item,
    },
    events::{self, EventSender},
    services::in_memory_gateway::InMemoryGateway,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Application wired to an in-memory SQLite database and the in-memory gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<InMemoryGateway>,
    pub customer_id: Uuid,
    customer_token: String,
    admin_token: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller tweak the configuration.
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.payments.provider = "mock".to_string();
        customize(&mut cfg);

        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            ..DbConfig::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(InMemoryGateway::new(cfg.payments.clone()));
        let state = AppState::new(Arc::new(pool), cfg.clone(), event_sender, gateway.clone());

        let router = Router::new()
            .nest("/api/v1", storefront_api::api_v1_routes())
            .layer(axum::middleware::from_fn(
                storefront_api::middleware_helpers::request_id::request_id_middleware,
            ))
            .with_state(state.clone());

        let customer = seed_customer_row(&state).await;
        let customer_token = token_for(customer.id, &["customer"]);
        let admin_token = token_for(Uuid::new_v4(), &["admin"]);

        Self {
            router,
            state,
            gateway,
            customer_id: customer.id,
            customer_token,
            admin_token,
            _event_task: event_task,
        }
    }

    pub fn customer_token(&self) -> &str {
        &self.customer_token
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn as_customer(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        self.request(method, uri, body, Some(&self.customer_token)).await
    }

    pub async fn as_admin(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        self.request(method, uri, body, Some(&self.admin_token)).await
    }

    /// Raw request with explicit headers and body bytes (webhooks).
    pub async fn post_raw(
        &self,
        uri: &str,
        body: Vec<u8>,
        headers: &[(&str, String)],
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder.body(Body::from(body)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            base_price: Set(price),
            currency: Set("USD".to_string()),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        name: &str,
        price: Option<Decimal>,
    ) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(format!("VAR-{}", Uuid::new_v4().simple())),
            name: Set(name.to_string()),
            price: Set(price),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant")
    }

    pub async fn seed_address(&self) -> customer_address::Model {
        customer_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(self.customer_id),
            name: Set(Some("Home".to_string())),
            address_line_1: Set("1 Market St".to_string()),
            address_line_2: Set(None),
            city: Set("San Francisco".to_string()),
            province: Set("CA".to_string()),
            country_code: Set("US".to_string()),
            postal_code: Set("94105".to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed address")
    }

    /// DELIVERED order owned by the test customer, delivered `days_ago`
    /// days back, with one line per `(price, quantity)`.
    pub async fn seed_delivered_order(
        &self,
        days_ago: i64,
        lines: &[(Decimal, i32)],
    ) -> (order::Model, Vec<order_item::Model>) {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let address_id = Uuid::new_v4();
        let total: Decimal = lines.iter().map(|(p, q)| *p * Decimal::from(*q)).sum();
        let order = order::ActiveModel {
            id: Set(id),
            order_number: Set(format!("ORD-TEST-{}", id.simple())),
            user_id: Set(self.customer_id),
            status: Set(OrderStatus::Delivered),
            currency: Set("USD".to_string()),
            subtotal: Set(total),
            tax_amount: Set(Decimal::ZERO),
            shipping_amount: Set(Decimal::ZERO),
            discount_amount: Set(Decimal::ZERO),
            total_amount: Set(total),
            shipping_address_id: Set(address_id),
            billing_address_id: Set(address_id),
            notes: Set(None),
            delivered_at: Set(Some(now - Duration::days(days_ago))),
            created_at: Set(now - Duration::days(days_ago + 3)),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed order");

        let mut items = Vec::new();
        for (price, quantity) in lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(Uuid::new_v4()),
                variant_id: Set(None),
                sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
                name: Set("Seeded item".to_string()),
                quantity: Set(*quantity),
                unit_price: Set(*price),
                line_total: Set(*price * Decimal::from(*quantity)),
                created_at: Set(now),
            }
            .insert(&*self.state.db)
            .await
            .expect("seed order item");
            items.push(item);
        }
        (order, items)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

async fn seed_customer_row(state: &AppState) -> customer::Model {
    let now = Utc::now();
    let id = Uuid::new_v4();
    customer::ActiveModel {
        id: Set(id),
        email: Set(format!("{}@example.com", id.simple())),
        name: Set(Some("Test Customer".to_string())),
        phone: Set(None),
        gateway_customer_ref: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*state.db)
    .await
    .expect("seed customer")
}

pub fn token_for(user_id: Uuid, roles: &[&str]) -> String {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        name: Some("Test User".to_string()),
        email: Some("test@example.com".to_string()),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(1)).timestamp(),
        iss: "storefront-auth".to_string(),
        aud: "storefront-api".to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("encode access token")
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}
