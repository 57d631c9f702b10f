//! Capability interface over the external payment processor.
//!
//! Every method fails with `ServiceError::GatewayError` on transport or
//! provider errors; callers must not assume any partial success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{config::PaymentsConfig, errors::ServiceError};

/// Payment-intent status as reported by the gateway, parsed once at the
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExternalPaymentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Succeeded,
    Failed,
    Canceled,
    Unrecognized(String),
}

impl ExternalPaymentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "processing" => Self::Processing,
            "requires_capture" => Self::RequiresCapture,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unrecognized(raw) => raw,
        }
    }

    /// True once the payer has submitted a payment method for the intent.
    pub fn is_attempted(&self) -> bool {
        matches!(self, Self::RequiresAction | Self::Processing | Self::RequiresCapture)
    }
}

impl fmt::Display for ExternalPaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ExternalPaymentStatus {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl Serialize for ExternalPaymentStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExternalPaymentStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalRefundStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    Unrecognized(String),
}

impl ExternalRefundStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "requires_action" => Self::Pending,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl fmt::Display for ExternalRefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateIntentRequest {
    /// Minor currency units
    pub amount: i64,
    /// ISO 4217 code, any case
    pub currency: String,
    pub metadata: HashMap<String, String>,
    pub description: Option<String>,
    pub customer_ref: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayIntent {
    pub external_id: String,
    pub client_secret: String,
    pub status: ExternalPaymentStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRefund {
    pub external_refund_id: String,
    pub status: ExternalRefundStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayCustomer {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short provider name stored on each payment row
    fn name(&self) -> &'static str;

    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, ServiceError>;

    async fn retrieve(&self, external_id: &str) -> Result<ExternalPaymentStatus, ServiceError>;

    async fn confirm(&self, external_id: &str) -> Result<ExternalPaymentStatus, ServiceError>;

    /// Refunds `amount` minor units, or the remaining balance when `None`.
    async fn refund(
        &self,
        external_id: &str,
        amount: Option<i64>,
        idempotency_key: Option<String>,
    ) -> Result<GatewayRefund, ServiceError>;

    async fn retrieve_refund(
        &self,
        external_refund_id: &str,
    ) -> Result<ExternalRefundStatus, ServiceError>;

    async fn create_customer(&self, customer: GatewayCustomer) -> Result<String, ServiceError>;
}

/// Rejects amounts below the configured per-currency minimum.
pub fn ensure_minimum_amount(
    config: &PaymentsConfig,
    amount: i64,
    currency: &str,
) -> Result<(), ServiceError> {
    let minimum = config.minimum_amount(currency);
    if amount < minimum {
        return Err(ServiceError::AmountTooSmall {
            amount,
            minimum,
            currency: currency.to_ascii_uppercase(),
        });
    }
    Ok(())
}
