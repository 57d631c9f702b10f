use chrono::Duration as ChronoDuration;
use metrics::gauge;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{payments::PaymentService, refunds::RefundService};
use crate::{config::PaymentsConfig, entities::refund::RefundStatus, errors::ServiceError};

const BATCH_SIZE: u64 = 50;

/// Counts from one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub payments_checked: usize,
    pub payments_updated: usize,
    pub refunds_checked: usize,
    pub refunds_settled: usize,
    pub failures: usize,
}

/// Periodically asks the gateway about payments and refunds that have
/// not heard back, and feeds the answers through normal reconciliation.
#[derive(Clone)]
pub struct ReconciliationPoller {
    payments: Arc<PaymentService>,
    refunds: Arc<RefundService>,
    interval: Duration,
    stale_after: ChronoDuration,
}

impl ReconciliationPoller {
    pub fn new(payments: Arc<PaymentService>, refunds: Arc<RefundService>, config: &PaymentsConfig) -> Self {
        Self {
            payments,
            refunds,
            interval: Duration::from_secs(config.reconcile_interval_secs.max(1)),
            stale_after: ChronoDuration::seconds(config.reconcile_stale_after_secs as i64),
        }
    }

    pub fn with_stale_after(mut self, stale_after: ChronoDuration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// One pass over stale payments and pending refunds. Individual
    /// failures are counted and left for the next pass.
    pub async fn run_once(&self) -> Result<PollReport, ServiceError> {
        let mut report = PollReport::default();

        let stale = self.payments.list_stale(self.stale_after, BATCH_SIZE).await?;
        gauge!("storefront_stale_payments", stale.len() as f64);
        for payment in &stale {
            report.payments_checked += 1;
            match self.payments.reconcile_from_gateway(payment).await {
                Ok(outcome) if outcome.payment_status != payment.status => report.payments_updated += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(payment_id = %payment.id, error = %e, "Reconciliation of stale payment failed");
                }
            }
        }

        for refund in self.refunds.list_pending(BATCH_SIZE).await? {
            report.refunds_checked += 1;
            match self.refunds.settle_pending(refund.id).await {
                Ok(settled) if settled.status != RefundStatus::Pending => report.refunds_settled += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(refund_id = %refund.id, error = %e, "Settling pending refund failed");
                }
            }
        }

        Ok(report)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Starting reconciliation poller");
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                match self.run_once().await {
                    Ok(report) => debug!(?report, "Reconciliation pass finished"),
                    Err(e) => warn!(error = %e, "Reconciliation pass failed"),
                }
            }
        })
    }
}
