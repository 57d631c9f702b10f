//! Fixtures shared by the unit tests.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    db::{self, DbConfig},
    entities::{
        commerce::{cart, cart_item, customer, customer_address, product, product_variant, CartStatus},
        order::{self, OrderStatus},
        order_item,
        payment::{self, GatewayMetadata, PaymentStatus},
    },
    events::EventSender,
};

pub async fn test_db() -> Arc<DatabaseConnection> {
    let config = DbConfig {
        url: "sqlite::memory:".to_string(),
        ..DbConfig::default()
    };
    let pool = db::establish_connection_with_config(&config)
        .await
        .expect("in-memory sqlite");
    db::run_migrations(&pool).await.expect("migrations");
    Arc::new(pool)
}

/// Event sender whose receiver is drained in the background.
pub fn test_events() -> Arc<EventSender> {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    Arc::new(EventSender::new(tx))
}

pub async fn seed_product(db: &DatabaseConnection, name: &str, price: Decimal, active: bool) -> product::Model {
    let now = Utc::now();
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
        base_price: Set(price),
        currency: Set("USD".to_string()),
        is_active: Set(active),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed product")
}

pub async fn seed_variant(
    db: &DatabaseConnection,
    product_id: Uuid,
    name: &str,
    price: Option<Decimal>,
    active: bool,
) -> product_variant::Model {
    let now = Utc::now();
    product_variant::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        sku: Set(format!("VAR-{}", Uuid::new_v4().simple())),
        name: Set(name.to_string()),
        price: Set(price),
        is_active: Set(active),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed variant")
}

/// Active server cart owned by `customer_id`; returns the cart id.
pub async fn seed_cart(
    db: &DatabaseConnection,
    customer_id: Uuid,
    lines: &[(Uuid, Option<Uuid>, i32)],
) -> Uuid {
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        customer_id: Set(customer_id),
        currency: Set("USD".to_string()),
        status: Set(CartStatus::Active),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed cart");

    for (product_id, variant_id, quantity) in lines {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            product_id: Set(*product_id),
            variant_id: Set(*variant_id),
            quantity: Set(*quantity),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("seed cart item");
    }
    cart.id
}

pub async fn seed_customer(db: &DatabaseConnection) -> customer::Model {
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
    .insert(db)
    .await
    .expect("seed customer")
}

pub async fn seed_address(db: &DatabaseConnection, customer_id: Uuid) -> customer_address::Model {
    customer_address::ActiveModel {
        id: Set(Uuid::new_v4()),
        customer_id: Set(customer_id),
        name: Set(Some("Home".to_string())),
        address_line_1: Set("1 Market St".to_string()),
        address_line_2: Set(None),
        city: Set("San Francisco".to_string()),
        province: Set("CA".to_string()),
        country_code: Set("US".to_string()),
        postal_code: Set("94105".to_string()),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("seed address")
}

/// Order for 25.00 USD with one line. DELIVERED orders are stamped as
/// delivered a day ago.
pub async fn seed_order(db: &DatabaseConnection, user_id: Uuid, status: OrderStatus) -> order::Model {
    seed_order_with_total(db, user_id, status, Decimal::new(2500, 2)).await
}

pub async fn seed_order_with_total(
    db: &DatabaseConnection,
    user_id: Uuid,
    status: OrderStatus,
    total: Decimal,
) -> order::Model {
    let now = Utc::now();
    let id = Uuid::new_v4();
    let address_id = Uuid::new_v4();
    let order = order::ActiveModel {
        id: Set(id),
        order_number: Set(format!("ORD-TEST-{}", id.simple())),
        user_id: Set(user_id),
        status: Set(status),
        currency: Set("USD".to_string()),
        subtotal: Set(total),
        tax_amount: Set(Decimal::ZERO),
        shipping_amount: Set(Decimal::ZERO),
        discount_amount: Set(Decimal::ZERO),
        total_amount: Set(total),
        shipping_address_id: Set(address_id),
        billing_address_id: Set(address_id),
        notes: Set(None),
        delivered_at: Set((status == OrderStatus::Delivered).then(|| now - Duration::days(1))),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed order");

    order_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        product_id: Set(Uuid::new_v4()),
        variant_id: Set(None),
        sku: Set("SKU-TEST".to_string()),
        name: Set("Test item".to_string()),
        quantity: Set(1),
        unit_price: Set(total),
        line_total: Set(total),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed order item");

    order
}

/// COMPLETED payment of `amount` cents on a fresh order in `order_status`.
pub async fn seed_completed_payment(
    db: &DatabaseConnection,
    order_status: OrderStatus,
    amount: i64,
    intent_id: Option<&str>,
) -> payment::Model {
    let order = seed_order_with_total(db, Uuid::new_v4(), order_status, Decimal::new(amount, 2)).await;
    let now = Utc::now();
    let metadata = GatewayMetadata {
        intent_id: intent_id.map(str::to_string),
        last_status: Some("succeeded".to_string()),
        confirmed_at: Some(now),
        ..GatewayMetadata::default()
    };
    payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        amount: Set(amount),
        currency: Set("USD".to_string()),
        status: Set(PaymentStatus::Completed),
        method: Set("card".to_string()),
        gateway: Set(if intent_id.is_some() { "mock" } else { "manual" }.to_string()),
        gateway_intent_id: Set(intent_id.map(str::to_string)),
        gateway_metadata: Set(Some(metadata.to_json())),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed payment")
}
