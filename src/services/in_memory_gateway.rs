use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::payment_gateway::{
    ensure_minimum_amount, CreateIntentRequest, ExternalPaymentStatus, ExternalRefundStatus,
    GatewayCustomer, GatewayIntent, GatewayRefund, PaymentGateway,
};
use crate::{config::PaymentsConfig, errors::ServiceError};

#[derive(Debug, Clone)]
struct IntentRecord {
    amount: i64,
    status: ExternalPaymentStatus,
    refunded: i64,
}

/// Deterministic gateway kept entirely in memory. Backs the `mock`
/// provider in development and the integration tests.
#[derive(Debug)]
pub struct InMemoryGateway {
    config: PaymentsConfig,
    sequence: AtomicU64,
    intents: DashMap<String, IntentRecord>,
    refunds: DashMap<String, ExternalRefundStatus>,
    customers: DashMap<String, GatewayCustomer>,
    /// Status the next refunds report
    refund_outcome: Mutex<ExternalRefundStatus>,
    unavailable: AtomicBool,
}

impl InMemoryGateway {
    pub fn new(config: PaymentsConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(1),
            intents: DashMap::new(),
            refunds: DashMap::new(),
            customers: DashMap::new(),
            refund_outcome: Mutex::new(ExternalRefundStatus::Succeeded),
            unavailable: AtomicBool::new(false),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_mock_{:06}", prefix, self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    fn available(&self) -> Result<(), ServiceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ServiceError::gateway("mock gateway is unavailable"))
        } else {
            Ok(())
        }
    }

    /// Simulates an outage: every call fails with `GatewayError`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Moves an intent to `status`, as the payer completing checkout would.
    pub fn set_intent_status(&self, external_id: &str, status: ExternalPaymentStatus) {
        if let Some(mut intent) = self.intents.get_mut(external_id) {
            intent.status = status;
        }
    }

    pub fn intent_status(&self, external_id: &str) -> Option<ExternalPaymentStatus> {
        self.intents.get(external_id).map(|i| i.status.clone())
    }

    pub fn set_refund_outcome(&self, status: ExternalRefundStatus) {
        if let Ok(mut outcome) = self.refund_outcome.lock() {
            *outcome = status;
        }
    }

    pub fn settle_refund(&self, external_refund_id: &str, status: ExternalRefundStatus) {
        self.refunds.insert(external_refund_id.to_string(), status);
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }

    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, ServiceError> {
        self.available()?;
        ensure_minimum_amount(&self.config, request.amount, &request.currency)?;

        let external_id = self.next_id("pi");
        let client_secret = format!("{}_secret", external_id);
        let status = ExternalPaymentStatus::RequiresPaymentMethod;
        self.intents.insert(
            external_id.clone(),
            IntentRecord {
                amount: request.amount,
                status: status.clone(),
                refunded: 0,
            },
        );

        Ok(GatewayIntent {
            external_id,
            client_secret,
            status,
        })
    }

    async fn retrieve(&self, external_id: &str) -> Result<ExternalPaymentStatus, ServiceError> {
        self.available()?;
        self.intent_status(external_id)
            .ok_or_else(|| ServiceError::gateway(format!("no such payment intent: {}", external_id)))
    }

    async fn confirm(&self, external_id: &str) -> Result<ExternalPaymentStatus, ServiceError> {
        self.available()?;
        let mut intent = self
            .intents
            .get_mut(external_id)
            .ok_or_else(|| ServiceError::gateway(format!("no such payment intent: {}", external_id)))?;
        if matches!(
            intent.status,
            ExternalPaymentStatus::RequiresPaymentMethod
                | ExternalPaymentStatus::RequiresConfirmation
        ) {
            intent.status = ExternalPaymentStatus::Succeeded;
        }
        Ok(intent.status.clone())
    }

    async fn refund(
        &self,
        external_id: &str,
        amount: Option<i64>,
        _idempotency_key: Option<String>,
    ) -> Result<GatewayRefund, ServiceError> {
        self.available()?;
        let mut intent = self
            .intents
            .get_mut(external_id)
            .ok_or_else(|| ServiceError::gateway(format!("no such payment intent: {}", external_id)))?;
        if intent.status != ExternalPaymentStatus::Succeeded {
            return Err(ServiceError::gateway("payment intent has not succeeded"));
        }

        let remaining = intent.amount - intent.refunded;
        let amount = amount.unwrap_or(remaining);
        if amount <= 0 || amount > remaining {
            return Err(ServiceError::gateway("refund amount exceeds the charge"));
        }

        let status = self
            .refund_outcome
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ExternalRefundStatus::Succeeded);
        if matches!(
            status,
            ExternalRefundStatus::Succeeded | ExternalRefundStatus::Pending
        ) {
            intent.refunded += amount;
        }
        drop(intent);

        let external_refund_id = self.next_id("re");
        self.refunds
            .insert(external_refund_id.clone(), status.clone());
        Ok(GatewayRefund {
            external_refund_id,
            status,
        })
    }

    async fn retrieve_refund(
        &self,
        external_refund_id: &str,
    ) -> Result<ExternalRefundStatus, ServiceError> {
        self.available()?;
        self.refunds
            .get(external_refund_id)
            .map(|s| s.clone())
            .ok_or_else(|| ServiceError::gateway(format!("no such refund: {}", external_refund_id)))
    }

    async fn create_customer(&self, customer: GatewayCustomer) -> Result<String, ServiceError> {
        self.available()?;
        let id = self.next_id("cus");
        self.customers.insert(id.clone(), customer);
        Ok(id)
    }
}
