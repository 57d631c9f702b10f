use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    commerce::{CartSnapshot, CartSnapshotResolver, CartSource},
    money::{decimal_from_f64, to_minor_units},
    order_locks::OrderLocks,
    order_status::{apply_transition, is_cancellable, is_valid_transition},
    refunds::RefundService,
};
use crate::{
    config::{CheckoutConfig, RefundConfig},
    db::for_update,
    entities::{
        commerce::{cart, customer_address, CartStatus, CustomerAddress},
        order::{self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_item::{self, ActiveModel as OrderItemActiveModel, Entity as OrderItemEntity, Model as OrderItemModel},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
        refund::Model as RefundModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Monetary breakdown fixed when an order is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderTotals {
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub tax: Decimal,
    #[schema(value_type = String)]
    pub shipping: Decimal,
    #[schema(value_type = String)]
    pub discount: Decimal,
    #[schema(value_type = String)]
    pub total: Decimal,
}

impl OrderTotals {
    /// total = subtotal + tax + shipping - discount, with tax rounded to
    /// cents and the discount clamped to `[0, subtotal]`.
    pub fn compute(
        subtotal: Decimal,
        tax_rate: Decimal,
        flat_shipping: Decimal,
        free_shipping_threshold: Option<Decimal>,
        discount: Decimal,
    ) -> Self {
        let tax = (subtotal * tax_rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let shipping = match free_shipping_threshold {
            Some(threshold) if subtotal >= threshold => Decimal::ZERO,
            _ => flat_shipping,
        };
        let discount = discount.max(Decimal::ZERO).min(subtotal);
        Self {
            subtotal,
            tax,
            shipping,
            discount,
            total: subtotal + tax + shipping - discount,
        }
    }
}

/// Pricing inputs taken from `CheckoutConfig`
#[derive(Debug, Clone, Copy)]
pub struct PricingPolicy {
    pub tax_rate: Decimal,
    pub flat_shipping: Decimal,
    pub free_shipping_threshold: Option<Decimal>,
}

impl From<&CheckoutConfig> for PricingPolicy {
    fn from(cfg: &CheckoutConfig) -> Self {
        Self {
            tax_rate: decimal_from_f64(cfg.tax_rate),
            flat_shipping: decimal_from_f64(cfg.flat_shipping),
            free_shipping_threshold: cfg.free_shipping_threshold.map(decimal_from_f64),
        }
    }
}

impl PricingPolicy {
    pub fn totals(&self, snapshot: &CartSnapshot, discount: Decimal) -> OrderTotals {
        OrderTotals::compute(
            snapshot.subtotal(),
            self.tax_rate,
            self.flat_shipping,
            self.free_shipping_threshold,
            discount,
        )
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub cart: CartSource,
    pub shipping_address_id: Option<Uuid>,
    pub billing_address_id: Option<Uuid>,
    /// Promotional discount resolved before checkout
    pub discount: Decimal,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

/// Line selection for a partial refund
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RefundItemRequest {
    pub order_item_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct RefundRequestInput {
    pub reason: String,
    pub items: Option<Vec<RefundItemRequest>>,
}

/// How a payment outcome affects the order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    /// Still in flight or waiting on the payer
    Pending,
    /// Declined; the payer may retry
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEffect {
    Transitioned { from: OrderStatus, to: OrderStatus },
    Unchanged,
    /// The outcome called for a transition the order can no longer make
    Ignored,
}

/// Owns order creation, status transitions and refund requests
#[derive(Clone)]
pub struct OrderLedger {
    db: Arc<DatabaseConnection>,
    events: Arc<EventSender>,
    locks: OrderLocks,
    resolver: CartSnapshotResolver,
    pricing: PricingPolicy,
    refund_window_days: i64,
    refunds: Arc<RefundService>,
}

impl OrderLedger {
    pub fn new(
        db: Arc<DatabaseConnection>,
        events: Arc<EventSender>,
        locks: OrderLocks,
        checkout: &CheckoutConfig,
        refund_config: &RefundConfig,
        refunds: Arc<RefundService>,
    ) -> Self {
        Self {
            resolver: CartSnapshotResolver::new(db.clone(), checkout.default_currency.clone()),
            db,
            events,
            locks,
            pricing: PricingPolicy::from(checkout),
            refund_window_days: refund_config.window_days,
            refunds,
        }
    }

    /// Snapshots the cart and persists a PENDING order with its items.
    #[instrument(skip(self, input), fields(user_id = %user_id))]
    pub async fn create(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<OrderWithItems, ServiceError> {
        let snapshot = self.resolver.resolve(user_id, &input.cart).await?;
        let shipping_address_id = input.shipping_address_id.ok_or(ServiceError::AddressRequired)?;
        self.ensure_address_owned(user_id, shipping_address_id).await?;
        let billing_address_id = match input.billing_address_id {
            Some(id) if id != shipping_address_id => {
                self.ensure_address_owned(user_id, id).await?;
                id
            }
            _ => shipping_address_id,
        };

        let totals = self.pricing.totals(&snapshot, input.discount);
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let db = &*self.db;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderActiveModel {
            id: Set(order_id),
            order_number: Set(order_number(order_id, now)),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending),
            currency: Set(snapshot.currency.clone()),
            subtotal: Set(totals.subtotal),
            tax_amount: Set(totals.tax),
            shipping_amount: Set(totals.shipping),
            discount_amount: Set(totals.discount),
            total_amount: Set(totals.total),
            shipping_address_id: Set(shipping_address_id),
            billing_address_id: Set(billing_address_id),
            notes: Set(input.notes.filter(|n| !n.trim().is_empty())),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, %order_id, "Failed to create order in database");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(snapshot.lines.len());
        for line in &snapshot.lines {
            let item = OrderItemActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                variant_id: Set(line.variant_id),
                sku: Set(line.sku.clone()),
                name: Set(line.name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_total: Set(line.line_total()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, %order_id, "Failed to create order item");
                ServiceError::DatabaseError(e)
            })?;
            items.push(item);
        }

        if let Some(cart_id) = snapshot.cart_id {
            let cart = cart::ActiveModel {
                id: Set(cart_id),
                status: Set(CartStatus::Converted),
                updated_at: Set(now),
                ..Default::default()
            };
            cart.update(&txn).await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(%order_id, total = %totals.total, items = items.len(), "Order created");
        self.events
            .send_or_log(Event::OrderCreated { order_id, user_id })
            .await;

        Ok(OrderWithItems { order, items })
    }

    /// Loads an order; `owner` restricts the lookup to one user's orders.
    pub async fn find(&self, order_id: Uuid, owner: Option<Uuid>) -> Result<OrderModel, ServiceError> {
        find_order(&*self.db, order_id, owner).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, order_id: Uuid, owner: Option<Uuid>) -> Result<OrderWithItems, ServiceError> {
        let order = self.find(order_id, owner).await?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(OrderWithItems { order, items })
    }

    /// Newest first; returns the page and the total count.
    #[instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let paginator = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    /// Cancels a PENDING or CONFIRMED order. Payments are left alone.
    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        owner: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let _guard = self.locks.acquire(order_id).await;
        let txn = self.db.begin().await?;
        let order = find_order_locked(&txn, order_id, owner).await?;

        if !is_cancellable(order.status) {
            return Err(ServiceError::OrderNotCancellable {
                current: order.status,
            });
        }

        let previous = order.status;
        let note = format!(
            "Cancelled: {}",
            reason.as_deref().filter(|r| !r.trim().is_empty()).unwrap_or("no reason given")
        );
        let updated = apply_transition(&txn, order, OrderStatus::Cancelled, Some(&note)).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_id, "Failed to commit order cancellation");
            ServiceError::DatabaseError(e)
        })?;

        self.events
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: previous,
                new_status: OrderStatus::Cancelled,
            })
            .await;
        self.events
            .send_or_log(Event::OrderCancelled { order_id, reason })
            .await;
        Ok(updated)
    }

    /// Fulfillment transitions after payment: CONFIRMED -> PROCESSING ->
    /// SHIPPED -> DELIVERED.
    #[instrument(skip(self))]
    pub async fn advance(&self, order_id: Uuid, target: OrderStatus) -> Result<OrderModel, ServiceError> {
        if !matches!(
            target,
            OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered
        ) {
            return Err(ServiceError::ValidationError(format!(
                "{} is not a fulfillment status",
                target
            )));
        }

        let _guard = self.locks.acquire(order_id).await;
        let txn = self.db.begin().await?;
        let order = find_order_locked(&txn, order_id, None).await?;
        let previous = order.status;
        let updated = apply_transition(&txn, order, target, None).await?;
        txn.commit().await?;

        self.events
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: previous,
                new_status: target,
            })
            .await;
        Ok(updated)
    }

    /// Applies a payment outcome to an order inside the caller's
    /// transaction. Only PENDING orders move.
    pub async fn transition_on_payment_outcome<C: ConnectionTrait>(
        conn: &C,
        order: OrderModel,
        outcome: PaymentOutcome,
    ) -> Result<(OrderModel, OutcomeEffect), ServiceError> {
        let target = match outcome {
            PaymentOutcome::Succeeded => OrderStatus::Confirmed,
            PaymentOutcome::Canceled => OrderStatus::Cancelled,
            PaymentOutcome::Pending | PaymentOutcome::Failed => {
                return Ok((order, OutcomeEffect::Unchanged))
            }
        };

        if order.status == target {
            return Ok((order, OutcomeEffect::Unchanged));
        }
        if order.status != OrderStatus::Pending || !is_valid_transition(order.status, target) {
            warn!(
                order_id = %order.id,
                current = %order.status,
                requested = %target,
                "Payment outcome arrived after the order left PENDING"
            );
            return Ok((order, OutcomeEffect::Ignored));
        }

        let from = order.status;
        let note = (outcome == PaymentOutcome::Canceled).then_some("Cancelled: payment was cancelled");
        let updated = apply_transition(conn, order, target, note).await?;
        Ok((updated, OutcomeEffect::Transitioned { from, to: target }))
    }

    /// Requests a refund for a delivered order inside the return window.
    /// The order only becomes REFUNDED once the refund completes in full.
    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn request_refund(
        &self,
        order_id: Uuid,
        owner: Option<Uuid>,
        input: RefundRequestInput,
    ) -> Result<(OrderModel, RefundModel), ServiceError> {
        let order = self.find(order_id, owner).await?;
        self.ensure_refund_eligible(&order)?;

        let amount = match &input.items {
            Some(items) if !items.is_empty() => Some(self.refund_amount_for_items(&order, items).await?),
            _ => None,
        };

        let payment = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .order_by_desc(payment::Column::CreatedAt)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::PaymentNotFound(format!("no completed payment for order {}", order_id))
            })?;

        let (refund, updated) = self
            .refunds
            .refund_with_order_note(payment.id, amount, input.reason)
            .await?;

        self.events
            .send_or_log(Event::RefundRequested {
                order_id,
                refund_id: refund.id,
            })
            .await;
        Ok((updated, refund))
    }

    fn ensure_refund_eligible(&self, order: &OrderModel) -> Result<(), ServiceError> {
        let delivered_at = match (order.status, order.delivered_at) {
            (OrderStatus::Delivered, Some(at)) => at,
            _ => {
                return Err(ServiceError::OrderNotDelivered {
                    current: order.status,
                })
            }
        };

        let days_since_delivery = (Utc::now() - delivered_at).num_days();
        if days_since_delivery > self.refund_window_days {
            return Err(ServiceError::RefundWindowExpired {
                days_since_delivery,
                window_days: self.refund_window_days,
            });
        }
        Ok(())
    }

    async fn refund_amount_for_items(
        &self,
        order: &OrderModel,
        requested: &[RefundItemRequest],
    ) -> Result<i64, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;

        let mut amount = Decimal::ZERO;
        for req in requested {
            let item = items
                .iter()
                .find(|i| i.id == req.order_item_id)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "item {} is not part of order {}",
                        req.order_item_id, order.id
                    ))
                })?;
            if req.quantity <= 0 || req.quantity > item.quantity {
                return Err(ServiceError::InvalidQuantity {
                    product_id: item.product_id,
                    quantity: req.quantity,
                });
            }
            amount += item.unit_price * Decimal::from(req.quantity);
        }

        to_minor_units(amount, &order.currency)
    }

    async fn ensure_address_owned(&self, user_id: Uuid, address_id: Uuid) -> Result<(), ServiceError> {
        CustomerAddress::find_by_id(address_id)
            .filter(customer_address::Column::CustomerId.eq(user_id))
            .one(&*self.db)
            .await?
            .map(|_| ())
            .ok_or_else(|| ServiceError::ValidationError(format!("address {} not found", address_id)))
    }
}

fn order_number(order_id: Uuid, at: chrono::DateTime<Utc>) -> String {
    let simple = order_id.simple().to_string();
    format!("ORD-{}-{}", at.format("%Y%m%d"), simple[..8].to_ascii_uppercase())
}

pub(crate) async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    owner: Option<Uuid>,
) -> Result<OrderModel, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .filter(|o| owner.map_or(true, |user| o.user_id == user))
        .ok_or(ServiceError::OrderNotFound(order_id))
}

/// Re-reads an order inside a transaction, holding its row lock where the
/// backend has one.
pub(crate) async fn find_order_locked<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    owner: Option<Uuid>,
) -> Result<OrderModel, ServiceError> {
    for_update(OrderEntity::find_by_id(order_id), conn)
        .one(conn)
        .await?
        .filter(|o| owner.map_or(true, |user| o.user_id == user))
        .ok_or(ServiceError::OrderNotFound(order_id))
}
