//! Payment intents and reconciliation of gateway-reported outcomes.
//!
//! Every status report, whether it comes from the payer's client, a
//! webhook or the poller, goes through [`PaymentService::confirm`].
//! Reports may arrive more than once and out of order. Terminal payments
//! never move again, and the payment and order rows change in one
//! transaction while the order's lock is held.

use chrono::{Duration, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    money::to_minor_units,
    order_locks::OrderLocks,
    orders::{find_order, find_order_locked, OrderLedger, OutcomeEffect, PaymentOutcome},
    payment_gateway::{ensure_minimum_amount, CreateIntentRequest, ExternalPaymentStatus, GatewayCustomer, PaymentGateway},
};
use crate::{
    config::PaymentsConfig,
    db::for_update,
    entities::{
        commerce::{customer, Customer},
        order::{Model as OrderModel, OrderStatus},
        payment::{self, ActiveModel as PaymentActiveModel, Entity as PaymentEntity, GatewayMetadata, Model as PaymentModel, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

#[derive(Debug, Clone)]
pub struct CreateIntentInput {
    pub order_id: Uuid,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
}

/// What the payer-facing flow needs to complete a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntentHandle {
    pub payment_id: Uuid,
    pub external_id: String,
    pub client_secret: String,
    pub status: PaymentStatus,
    /// True when an in-flight intent for the same amount was handed back
    pub reused: bool,
}

/// Statuses after applying a report. `applied` is false for no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationOutcome {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    pub applied: bool,
}

/// Maps an external status to the local payment status and the outcome
/// handed to the order. `None` means the report only refreshes metadata.
///
/// `requires_payment_method` is also the state of a fresh intent waiting
/// for the payer, so it only fails the payment after `previous` shows an
/// attempt was made.
pub fn reconcile_target(
    status: &ExternalPaymentStatus,
    previous: Option<&ExternalPaymentStatus>,
) -> Option<(PaymentStatus, PaymentOutcome)> {
    match status {
        ExternalPaymentStatus::Succeeded => Some((PaymentStatus::Completed, PaymentOutcome::Succeeded)),
        ExternalPaymentStatus::Processing => Some((PaymentStatus::Processing, PaymentOutcome::Pending)),
        ExternalPaymentStatus::Failed => Some((PaymentStatus::Failed, PaymentOutcome::Failed)),
        ExternalPaymentStatus::RequiresPaymentMethod
            if previous.is_some_and(ExternalPaymentStatus::is_attempted) =>
        {
            Some((PaymentStatus::Failed, PaymentOutcome::Failed))
        }
        ExternalPaymentStatus::Canceled => Some((PaymentStatus::Cancelled, PaymentOutcome::Canceled)),
        ExternalPaymentStatus::RequiresPaymentMethod
        | ExternalPaymentStatus::RequiresConfirmation
        | ExternalPaymentStatus::RequiresAction
        | ExternalPaymentStatus::RequiresCapture
        | ExternalPaymentStatus::Unrecognized(_) => None,
    }
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<EventSender>,
    locks: OrderLocks,
    config: PaymentsConfig,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<EventSender>,
        locks: OrderLocks,
        config: PaymentsConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            events,
            locks,
            config,
        }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    /// Opens a gateway intent for a PENDING order and records a PENDING
    /// payment carrying its external id.
    #[instrument(skip(self, input), fields(order_id = %input.order_id, amount = input.amount))]
    pub async fn create_intent(
        &self,
        owner: Option<Uuid>,
        input: CreateIntentInput,
    ) -> Result<PaymentIntentHandle, ServiceError> {
        let currency = input.currency.trim().to_ascii_uppercase();
        let order = find_order(&*self.db, input.order_id, owner).await?;
        ensure_payable(&order, &currency)?;
        ensure_minimum_amount(&self.config, input.amount, &currency)?;
        ensure_covers_total(&order, input.amount, &currency)?;

        let _guard = self.locks.acquire(order.id).await;
        let order = find_order(&*self.db, order.id, None).await?;
        ensure_payable(&order, &currency)?;

        if let Some(existing) = self.in_flight_payment(order.id).await? {
            let metadata = existing.metadata();
            return match (existing.gateway_intent_id.clone(), metadata.client_secret) {
                (Some(external_id), Some(client_secret))
                    if existing.amount == input.amount && existing.currency == currency =>
                {
                    info!(payment_id = %existing.id, "Reusing in-flight payment intent");
                    counter!("storefront_payment_intents_total", 1, "result" => "reused");
                    Ok(PaymentIntentHandle {
                        payment_id: existing.id,
                        external_id,
                        client_secret,
                        status: existing.status,
                        reused: true,
                    })
                }
                _ => Err(ServiceError::PaymentInProgress {
                    order_id: order.id,
                    payment_id: existing.id,
                }),
            };
        }

        let customer_ref = self.customer_ref_for(order.user_id).await?;
        let payment_id = Uuid::new_v4();
        let metadata = HashMap::from([
            ("order_id".to_string(), order.id.to_string()),
            ("payment_id".to_string(), payment_id.to_string()),
            ("order_number".to_string(), order.order_number.clone()),
        ]);

        let intent = self
            .gateway
            .create_intent(CreateIntentRequest {
                amount: input.amount,
                currency: currency.clone(),
                metadata,
                description: Some(format!("Order {}", order.order_number)),
                customer_ref: customer_ref.clone(),
                idempotency_key: Some(payment_id.to_string()),
            })
            .await
            .map_err(|e| {
                counter!("storefront_payment_intents_total", 1, "result" => "gateway_error");
                e
            })?;

        let now = Utc::now();
        let stored = GatewayMetadata {
            intent_id: Some(intent.external_id.clone()),
            client_secret: Some(intent.client_secret.clone()),
            customer_ref,
            last_status: Some(intent.status.as_str().to_string()),
            last_reported_at: Some(now),
            confirmed_at: None,
        };

        let payment = PaymentActiveModel {
            id: Set(payment_id),
            order_id: Set(order.id),
            amount: Set(input.amount),
            currency: Set(currency),
            status: Set(PaymentStatus::Pending),
            method: Set("card".to_string()),
            gateway: Set(self.gateway.name().to_string()),
            gateway_intent_id: Set(Some(intent.external_id.clone())),
            gateway_metadata: Set(Some(stored.to_json())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| {
            error!(error = %e, external_id = %intent.external_id, "Failed to record payment intent");
            ServiceError::DatabaseError(e)
        })?;

        info!(payment_id = %payment.id, external_id = %intent.external_id, "Payment intent created");
        counter!("storefront_payment_intents_total", 1, "result" => "created");
        self.events
            .send_or_log(Event::PaymentIntentCreated {
                payment_id: payment.id,
                order_id: order.id,
                external_id: intent.external_id.clone(),
            })
            .await;

        Ok(PaymentIntentHandle {
            payment_id: payment.id,
            external_id: intent.external_id,
            client_secret: intent.client_secret,
            status: payment.status,
            reused: false,
        })
    }

    /// Applies a reported gateway status to the payment and its order.
    #[instrument(skip(self), fields(external_id = %external_id, reported = %reported))]
    pub async fn confirm(
        &self,
        external_id: &str,
        reported: ExternalPaymentStatus,
    ) -> Result<ReconciliationOutcome, ServiceError> {
        let payment = self.find_by_external_id(external_id).await?;
        let _guard = self.locks.acquire(payment.order_id).await;

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start reconciliation transaction");
            ServiceError::DatabaseError(e)
        })?;

        let payment = for_update(PaymentEntity::find_by_id(payment.id), &txn)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(external_id.to_string()))?;
        let order = find_order_locked(&txn, payment.order_id, None).await?;

        if payment.status.is_terminal() {
            txn.commit().await?;
            info!(payment_id = %payment.id, status = %payment.status, "Payment already final; report ignored");
            counter!("storefront_reconciliations_total", 1, "result" => "noop");
            return Ok(ReconciliationOutcome {
                payment_id: payment.id,
                order_id: order.id,
                payment_status: payment.status,
                order_status: order.status,
                applied: false,
            });
        }

        let now = Utc::now();
        let mut metadata = payment.metadata();
        let previous = metadata.last_status.as_deref().map(ExternalPaymentStatus::parse);
        let target = reconcile_target(&reported, previous.as_ref());
        metadata.last_status = Some(reported.as_str().to_string());
        metadata.last_reported_at = Some(now);

        if target.is_none() {
            warn!(payment_id = %payment.id, "Status does not move the payment; metadata refreshed");
        }
        let payment_status = target.map_or(payment.status, |(status, _)| status);
        if payment_status.is_terminal() {
            metadata.confirmed_at = Some(now);
        }

        let payment_id = payment.id;
        let mut active: PaymentActiveModel = payment.into();
        active.status = Set(payment_status);
        active.gateway_metadata = Set(Some(metadata.to_json()));
        active.updated_at = Set(now);
        active.update(&txn).await.map_err(|e| {
            error!(error = %e, %payment_id, "Failed to update payment");
            ServiceError::DatabaseError(e)
        })?;

        let (order, effect) = match target {
            Some((_, outcome)) => OrderLedger::transition_on_payment_outcome(&txn, order, outcome).await?,
            None => (order, OutcomeEffect::Unchanged),
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, %payment_id, "Failed to commit reconciliation");
            ServiceError::DatabaseError(e)
        })?;

        info!(%payment_id, payment_status = %payment_status, order_status = %order.status, "Payment reconciled");
        counter!("storefront_reconciliations_total", 1, "result" => "applied");
        self.publish(payment_id, &order, payment_status, effect).await;

        Ok(ReconciliationOutcome {
            payment_id,
            order_id: order.id,
            payment_status,
            order_status: order.status,
            applied: true,
        })
    }

    /// Handles a confirmation reported by the payer's client. With
    /// verification on, or when no status is given, the gateway is asked
    /// instead of trusting the report.
    pub async fn confirm_reported(
        &self,
        owner: Option<Uuid>,
        external_id: &str,
        reported: Option<&str>,
    ) -> Result<ReconciliationOutcome, ServiceError> {
        let payment = self.find_by_external_id(external_id).await?;
        find_order(&*self.db, payment.order_id, owner)
            .await
            .map_err(|_| ServiceError::PaymentNotFound(external_id.to_string()))?;

        let status = match reported {
            Some(raw) if !self.config.verify_client_reports => ExternalPaymentStatus::parse(raw),
            _ => self.gateway.retrieve(external_id).await?,
        };
        self.confirm(external_id, status).await
    }

    /// Pulls the current status from the gateway and applies it.
    pub async fn reconcile_from_gateway(
        &self,
        payment: &PaymentModel,
    ) -> Result<ReconciliationOutcome, ServiceError> {
        let external_id = payment
            .gateway_intent_id
            .as_deref()
            .ok_or(ServiceError::NotGatewayProcessed(payment.id))?;
        let status = self.gateway.retrieve(external_id).await?;
        self.confirm(external_id, status).await
    }

    /// Non-terminal gateway payments untouched for at least `older_than`.
    pub async fn list_stale(&self, older_than: Duration, limit: u64) -> Result<Vec<PaymentModel>, ServiceError> {
        let cutoff = Utc::now() - older_than;
        Ok(PaymentEntity::find()
            .filter(payment::Column::Status.is_in([PaymentStatus::Pending, PaymentStatus::Processing]))
            .filter(payment::Column::GatewayIntentId.is_not_null())
            .filter(payment::Column::UpdatedAt.lte(cutoff))
            .order_by_asc(payment::Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    pub async fn get(&self, payment_id: Uuid) -> Result<PaymentModel, ServiceError> {
        PaymentEntity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(payment_id.to_string()))
    }

    pub async fn list_for_order(&self, order_id: Uuid, owner: Option<Uuid>) -> Result<Vec<PaymentModel>, ServiceError> {
        find_order(&*self.db, order_id, owner).await?;
        Ok(PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<PaymentModel, ServiceError> {
        PaymentEntity::find()
            .filter(payment::Column::GatewayIntentId.eq(external_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(external_id.to_string()))
    }

    async fn in_flight_payment(&self, order_id: Uuid) -> Result<Option<PaymentModel>, ServiceError> {
        Ok(PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.is_in([PaymentStatus::Pending, PaymentStatus::Processing]))
            .order_by_desc(payment::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Gateway customer handle cached on the customer row. Check-then-set:
    /// a race costs at most one spare gateway customer.
    async fn customer_ref_for(&self, user_id: Uuid) -> Result<Option<String>, ServiceError> {
        let Some(record) = Customer::find_by_id(user_id).one(&*self.db).await? else {
            return Ok(None);
        };
        if let Some(existing) = record.gateway_customer_ref.clone() {
            return Ok(Some(existing));
        }

        let created = self
            .gateway
            .create_customer(GatewayCustomer {
                email: record.email.clone(),
                name: record.name.clone(),
                phone: record.phone.clone(),
            })
            .await?;

        let mut active: customer::ActiveModel = record.into();
        active.gateway_customer_ref = Set(Some(created.clone()));
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        Ok(Some(created))
    }

    async fn publish(
        &self,
        payment_id: Uuid,
        order: &OrderModel,
        payment_status: PaymentStatus,
        effect: OutcomeEffect,
    ) {
        self.events
            .send_or_log(Event::PaymentReconciled {
                payment_id,
                order_id: order.id,
                payment_status,
                order_status: order.status,
            })
            .await;

        match effect {
            OutcomeEffect::Transitioned { from, to } => {
                self.events
                    .send_or_log(Event::OrderStatusChanged {
                        order_id: order.id,
                        old_status: from,
                        new_status: to,
                    })
                    .await;
                if to == OrderStatus::Cancelled {
                    self.events
                        .send_or_log(Event::OrderCancelled {
                            order_id: order.id,
                            reason: Some("payment was cancelled".to_string()),
                        })
                        .await;
                }
            }
            OutcomeEffect::Ignored => {
                counter!("storefront_reconciliations_total", 1, "result" => "order_ignored");
                self.events
                    .send_or_log(Event::PaymentOutcomeIgnored {
                        payment_id,
                        order_id: order.id,
                        order_status: order.status,
                    })
                    .await;
            }
            OutcomeEffect::Unchanged => {}
        }
    }
}

fn ensure_payable(order: &OrderModel, currency: &str) -> Result<(), ServiceError> {
    if order.status != OrderStatus::Pending {
        return Err(ServiceError::OrderNotPending {
            current: order.status,
        });
    }
    if !order.currency.eq_ignore_ascii_case(currency) {
        return Err(ServiceError::ValidationError(format!(
            "currency {} does not match order currency {}",
            currency, order.currency
        )));
    }
    Ok(())
}

/// The intent must charge exactly the total the ledger froze on the order.
fn ensure_covers_total(order: &OrderModel, amount: i64, currency: &str) -> Result<(), ServiceError> {
    let expected = to_minor_units(order.total_amount, &order.currency)?;
    if amount != expected {
        return Err(ServiceError::AmountMismatch {
            amount,
            expected,
            currency: currency.to_string(),
        });
    }
    Ok(())
}
