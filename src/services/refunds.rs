use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    order_locks::OrderLocks,
    order_status::apply_transition,
    orders::{find_order, find_order_locked},
    payment_gateway::{ExternalRefundStatus, PaymentGateway},
};
use crate::{
    db::for_update,
    entities::{
        order::{ActiveModel as OrderActiveModel, Model as OrderModel, OrderStatus},
        payment::{self, ActiveModel as PaymentActiveModel, Entity as PaymentEntity, Model as PaymentModel, PaymentStatus},
        refund::{self, ActiveModel as RefundActiveModel, Entity as RefundEntity, Model as RefundModel, RefundGatewayMetadata, RefundStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Reverses completed payments through the gateway and records the result
#[derive(Clone)]
pub struct RefundService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<EventSender>,
    locks: OrderLocks,
}

/// Local status for a refund the gateway accepted. Declines are errors.
fn refund_status_for(external: &ExternalRefundStatus) -> Result<RefundStatus, ServiceError> {
    match external {
        ExternalRefundStatus::Succeeded => Ok(RefundStatus::Completed),
        ExternalRefundStatus::Pending | ExternalRefundStatus::Unrecognized(_) => {
            Ok(RefundStatus::Pending)
        }
        ExternalRefundStatus::Failed | ExternalRefundStatus::Canceled => Err(
            ServiceError::gateway(format!("refund was not accepted: {}", external)),
        ),
    }
}

impl RefundService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<EventSender>,
        locks: OrderLocks,
    ) -> Self {
        Self {
            db,
            gateway,
            events,
            locks,
        }
    }

    /// Refunds `amount` minor units of a COMPLETED payment, or everything
    /// still refundable when `amount` is `None`. The payment's order must
    /// be DELIVERED.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        amount: Option<i64>,
        reason: String,
    ) -> Result<RefundModel, ServiceError> {
        let (refund, _) = self.execute(payment_id, amount, reason, false).await?;
        Ok(refund)
    }

    /// Like [`RefundService::refund`], and also notes the request on the
    /// order in the transaction that records the refund.
    pub async fn refund_with_order_note(
        &self,
        payment_id: Uuid,
        amount: Option<i64>,
        reason: String,
    ) -> Result<(RefundModel, OrderModel), ServiceError> {
        self.execute(payment_id, amount, reason, true).await
    }

    #[instrument(skip(self, reason), fields(payment_id = %payment_id, amount = ?amount))]
    async fn execute(
        &self,
        payment_id: Uuid,
        amount: Option<i64>,
        reason: String,
        note_on_order: bool,
    ) -> Result<(RefundModel, OrderModel), ServiceError> {
        let payment = self.completed_payment(&*self.db, payment_id).await?;
        let external_id = payment
            .gateway_intent_id
            .clone()
            .ok_or(ServiceError::NotGatewayProcessed(payment.id))?;

        let _guard = self.locks.acquire(payment.order_id).await;
        let payment = self.completed_payment(&*self.db, payment_id).await?;
        let order = find_order(&*self.db, payment.order_id, None).await?;
        if order.status != OrderStatus::Delivered {
            return Err(ServiceError::OrderNotDelivered {
                current: order.status,
            });
        }

        let refundable = payment.amount - committed_refunds(&*self.db, payment.id).await?;
        let requested = amount.unwrap_or(refundable);
        if amount.is_some() && requested <= 0 {
            return Err(ServiceError::ValidationError(
                "refund amount must be positive".to_string(),
            ));
        }
        if requested > refundable || refundable <= 0 {
            return Err(ServiceError::RefundExceedsPayment {
                requested,
                refundable,
            });
        }

        let refund_id = Uuid::new_v4();
        let gateway_refund = self
            .gateway
            .refund(&external_id, Some(requested), Some(refund_id.to_string()))
            .await
            .map_err(|e| {
                counter!("storefront_refunds_total", 1, "result" => "gateway_error");
                e
            })?;
        let status = refund_status_for(&gateway_refund.status).map_err(|e| {
            counter!("storefront_refunds_total", 1, "result" => "declined");
            warn!(status = %gateway_refund.status, "Gateway declined refund");
            e
        })?;

        let now = Utc::now();
        let metadata = RefundGatewayMetadata {
            last_status: Some(gateway_refund.status.as_str().to_string()),
            requested_at: Some(now),
            settled_at: (status == RefundStatus::Completed).then_some(now),
        };

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start refund transaction");
            ServiceError::DatabaseError(e)
        })?;

        let refund = RefundActiveModel {
            id: Set(refund_id),
            payment_id: Set(payment.id),
            order_id: Set(payment.order_id),
            amount: Set(requested),
            currency: Set(payment.currency.clone()),
            reason: Set(reason),
            status: Set(status),
            external_refund_id: Set(Some(gateway_refund.external_refund_id.clone())),
            metadata: Set(Some(metadata.to_json())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            // The gateway already moved money; this needs an operator.
            error!(
                error = %e,
                external_refund_id = %gateway_refund.external_refund_id,
                "Failed to record a refund the gateway accepted"
            );
            ServiceError::DatabaseError(e)
        })?;

        if note_on_order {
            let current = find_order_locked(&txn, payment.order_id, None).await?;
            let note = format!(
                "Refund requested ({} {}): {}",
                refund.amount, refund.currency, refund.reason
            );
            let mut active: OrderActiveModel = current.clone().into();
            active.notes = Set(Some(current.notes_with(&note)));
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }

        let fully_refunded = if status == RefundStatus::Completed {
            self.flip_if_fully_refunded(&txn, payment.id).await?
        } else {
            false
        };
        let order = find_order(&txn, payment.order_id, None).await?;

        txn.commit().await.map_err(|e| {
            error!(
                error = %e,
                %refund_id,
                external_refund_id = %gateway_refund.external_refund_id,
                "Failed to commit a refund the gateway accepted"
            );
            ServiceError::DatabaseError(e)
        })?;

        info!(%refund_id, status = %status, fully_refunded, "Refund recorded");
        counter!("storefront_refunds_total", 1, "result" => if status == RefundStatus::Completed { "completed" } else { "pending" });
        self.publish(&refund, fully_refunded).await;
        Ok((refund, order))
    }

    pub async fn get(&self, refund_id: Uuid) -> Result<Option<RefundModel>, ServiceError> {
        Ok(RefundEntity::find_by_id(refund_id).one(&*self.db).await?)
    }

    pub async fn list_for_payment(&self, payment_id: Uuid) -> Result<Vec<RefundModel>, ServiceError> {
        Ok(RefundEntity::find()
            .filter(refund::Column::PaymentId.eq(payment_id))
            .order_by_asc(refund::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn list_pending(&self, limit: u64) -> Result<Vec<RefundModel>, ServiceError> {
        Ok(RefundEntity::find()
            .filter(refund::Column::Status.eq(RefundStatus::Pending))
            .filter(refund::Column::ExternalRefundId.is_not_null())
            .order_by_asc(refund::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Asks the gateway about a PENDING refund and records the final
    /// outcome. Returns the refund as stored afterwards.
    #[instrument(skip(self))]
    pub async fn settle_pending(&self, refund_id: Uuid) -> Result<RefundModel, ServiceError> {
        let refund = RefundEntity::find_by_id(refund_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::ValidationError(format!("refund {} not found", refund_id)))?;
        let Some(external_refund_id) = refund.external_refund_id.clone() else {
            return Ok(refund);
        };
        if refund.status != RefundStatus::Pending {
            return Ok(refund);
        }

        let external = self.gateway.retrieve_refund(&external_refund_id).await?;
        let target = match external {
            ExternalRefundStatus::Succeeded => RefundStatus::Completed,
            ExternalRefundStatus::Failed | ExternalRefundStatus::Canceled => RefundStatus::Failed,
            ExternalRefundStatus::Pending | ExternalRefundStatus::Unrecognized(_) => {
                return Ok(refund)
            }
        };

        let _guard = self.locks.acquire(refund.order_id).await;
        let txn = self.db.begin().await?;
        let current = for_update(RefundEntity::find_by_id(refund_id), &txn)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError(format!("refund {} vanished", refund_id)))?;
        if current.status != RefundStatus::Pending {
            return Ok(current);
        }

        let now = Utc::now();
        let mut metadata: RefundGatewayMetadata = current
            .metadata
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        metadata.last_status = Some(external.as_str().to_string());
        metadata.settled_at = Some(now);

        let mut active: RefundActiveModel = current.into();
        active.status = Set(target);
        active.metadata = Set(Some(metadata.to_json()));
        active.updated_at = Set(now);
        let updated = active.update(&txn).await?;

        let fully_refunded = if target == RefundStatus::Completed {
            self.flip_if_fully_refunded(&txn, updated.payment_id).await?
        } else {
            false
        };
        txn.commit().await?;

        info!(%refund_id, status = %target, "Pending refund settled");
        if target == RefundStatus::Completed {
            self.publish(&updated, fully_refunded).await;
        }
        Ok(updated)
    }

    async fn completed_payment<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
    ) -> Result<PaymentModel, ServiceError> {
        PaymentEntity::find_by_id(payment_id)
            .one(conn)
            .await?
            .filter(|p| p.status == PaymentStatus::Completed)
            .ok_or_else(|| ServiceError::PaymentNotFound(payment_id.to_string()))
    }

    /// Once completed refunds cover the payment, marks the payment
    /// REFUNDED and a DELIVERED order REFUNDED.
    async fn flip_if_fully_refunded<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let payment = for_update(PaymentEntity::find_by_id(payment_id), conn)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(payment_id.to_string()))?;

        let completed: i64 = RefundEntity::find()
            .filter(refund::Column::PaymentId.eq(payment_id))
            .filter(refund::Column::Status.eq(RefundStatus::Completed))
            .all(conn)
            .await?
            .iter()
            .map(|r| r.amount)
            .sum();
        if completed < payment.amount || payment.status != PaymentStatus::Completed {
            return Ok(false);
        }

        let order_id = payment.order_id;
        let mut active: PaymentActiveModel = payment.into();
        active.status = Set(PaymentStatus::Refunded);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;

        let order = find_order_locked(conn, order_id, None).await?;
        if order.status != OrderStatus::Delivered {
            return Err(ServiceError::OrderNotDelivered {
                current: order.status,
            });
        }
        apply_transition(conn, order, OrderStatus::Refunded, Some("Refunded in full")).await?;
        Ok(true)
    }

    async fn publish(&self, refund: &RefundModel, fully_refunded: bool) {
        let event = match refund.status {
            RefundStatus::Completed => Event::RefundCompleted {
                refund_id: refund.id,
                payment_id: refund.payment_id,
                amount: refund.amount,
                fully_refunded,
            },
            RefundStatus::Pending => Event::RefundPending {
                refund_id: refund.id,
                payment_id: refund.payment_id,
                amount: refund.amount,
            },
            RefundStatus::Failed => return,
        };
        self.events.send_or_log(event).await;
    }
}

/// Sum of refunds that count against the payment: completed ones plus
/// those the gateway accepted but has not settled.
async fn committed_refunds<C: ConnectionTrait>(conn: &C, payment_id: Uuid) -> Result<i64, ServiceError> {
    Ok(RefundEntity::find()
        .filter(refund::Column::PaymentId.eq(payment_id))
        .filter(refund::Column::Status.is_in([RefundStatus::Completed, RefundStatus::Pending]))
        .all(conn)
        .await?
        .iter()
        .map(|r| r.amount)
        .sum())
}
