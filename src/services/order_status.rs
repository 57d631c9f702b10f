use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ConnectionTrait};
use tracing::{error, info};

use crate::{
    entities::order::{ActiveModel as OrderActiveModel, Model as OrderModel, OrderStatus},
    errors::ServiceError,
};

/// Whether `from -> to` is an edge of the order state graph:
/// PENDING -> CONFIRMED -> PROCESSING -> SHIPPED -> DELIVERED,
/// PENDING|CONFIRMED -> CANCELLED and DELIVERED -> REFUNDED.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Confirmed, Processing)
            | (Processing, Shipped)
            | (Shipped, Delivered)
            | (Pending, Cancelled)
            | (Confirmed, Cancelled)
            | (Delivered, Refunded)
    )
}

pub fn ensure_transition(current: OrderStatus, requested: OrderStatus) -> Result<(), ServiceError> {
    if is_valid_transition(current, requested) {
        Ok(())
    } else {
        Err(ServiceError::IllegalTransition { current, requested })
    }
}

pub fn is_cancellable(status: OrderStatus) -> bool {
    is_valid_transition(status, OrderStatus::Cancelled)
}

/// Validates and writes a status change on `conn`, which is normally an
/// open transaction. `note` is appended to the order notes.
pub async fn apply_transition<C: ConnectionTrait>(
    conn: &C,
    order: OrderModel,
    target: OrderStatus,
    note: Option<&str>,
) -> Result<OrderModel, ServiceError> {
    ensure_transition(order.status, target)?;

    let order_id = order.id;
    let previous = order.status;
    let now = Utc::now();
    let notes = note.map(|line| order.notes_with(line));

    let mut active: OrderActiveModel = order.into();
    active.status = Set(target);
    active.updated_at = Set(now);
    if let Some(notes) = notes {
        active.notes = Set(Some(notes));
    }
    if target == OrderStatus::Delivered {
        active.delivered_at = Set(Some(now));
    }

    let updated = active.update(conn).await.map_err(|e| {
        error!("Failed to update order {} status: {}", order_id, e);
        ServiceError::DatabaseError(e)
    })?;

    info!(%order_id, from = %previous, to = %target, "Order status updated");
    Ok(updated)
}
