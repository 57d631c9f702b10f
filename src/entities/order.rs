use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Persisted order. Money fields are fixed at creation; only `status`,
/// `notes`, `delivered_at` and `updated_at` change afterwards.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub tax_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_amount: Decimal,
    pub shipping_address_id: Uuid,
    pub billing_address_id: Uuid,
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
    #[sea_orm(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Appends a line to the free-text notes.
    pub fn notes_with(&self, line: &str) -> String {
        match self.notes.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, line),
            _ => line.to_string(),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,
    #[sea_orm(string_value = "PROCESSING")]
    Processing,
    #[sea_orm(string_value = "SHIPPED")]
    Shipped,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
    #[sea_orm(string_value = "REFUNDED")]
    Refunded,
}
