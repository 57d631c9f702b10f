pub mod common;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        order_locks::OrderLocks, orders::OrderLedger, payment_gateway::PaymentGateway,
        payments::PaymentService, refunds::RefundService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderLedger>,
    pub payments: Arc<PaymentService>,
    pub refunds: Arc<RefundService>,
}

impl AppServices {
    /// All services share one lock registry so that every path touching an
    /// order serializes on the same guard.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AppConfig,
    ) -> Self {
        let locks = OrderLocks::new();

        let refunds = Arc::new(RefundService::new(
            db_pool.clone(),
            gateway.clone(),
            event_sender.clone(),
            locks.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            db_pool.clone(),
            gateway,
            event_sender.clone(),
            locks.clone(),
            config.payments.clone(),
        ));
        let orders = Arc::new(OrderLedger::new(
            db_pool,
            event_sender,
            locks,
            &config.checkout,
            &config.refunds,
            refunds.clone(),
        ));

        Self {
            orders,
            payments,
            refunds,
        }
    }
}
