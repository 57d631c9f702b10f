use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{order::OrderStatus, payment::PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event and logs instead of failing. Events are only emitted
    /// after the owning transaction committed, so a lost event never
    /// affects the ledger.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

/// Domain events emitted by the order and payment lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: Option<String>,
    },
    PaymentIntentCreated {
        payment_id: Uuid,
        order_id: Uuid,
        external_id: String,
    },
    PaymentReconciled {
        payment_id: Uuid,
        order_id: Uuid,
        payment_status: PaymentStatus,
        order_status: OrderStatus,
    },
    /// A payment outcome arrived for an order that had already left PENDING
    PaymentOutcomeIgnored {
        payment_id: Uuid,
        order_id: Uuid,
        order_status: OrderStatus,
    },
    RefundCompleted {
        refund_id: Uuid,
        payment_id: Uuid,
        amount: i64,
        fully_refunded: bool,
    },
    RefundPending {
        refund_id: Uuid,
        payment_id: Uuid,
        amount: i64,
    },
    RefundRequested {
        order_id: Uuid,
        refund_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order.created",
            Event::OrderStatusChanged { .. } => "order.status_changed",
            Event::OrderCancelled { .. } => "order.cancelled",
            Event::PaymentIntentCreated { .. } => "payment.intent_created",
            Event::PaymentReconciled { .. } => "payment.reconciled",
            Event::PaymentOutcomeIgnored { .. } => "payment.outcome_ignored",
            Event::RefundCompleted { .. } => "refund.completed",
            Event::RefundPending { .. } => "refund.pending",
            Event::RefundRequested { .. } => "refund.requested",
        }
    }
}

/// Consumer loop; runs until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentOutcomeIgnored {
                payment_id,
                order_id,
                order_status,
            } => {
                warn!(
                    %payment_id,
                    %order_id,
                    %order_status,
                    "Payment outcome arrived after the order left PENDING; needs manual review"
                );
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_default();
                info!(event = other.name(), %payload, "Domain event");
            }
        }
        metrics::counter!("storefront_events_processed_total", 1, "event" => event.name());
    }

    info!("Event processing loop stopped");
}
