use async_trait::async_trait;
use metrics::counter;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, error, info, instrument, warn};

use super::payment_gateway::{
    ensure_minimum_amount, CreateIntentRequest, ExternalPaymentStatus, ExternalRefundStatus,
    GatewayCustomer, GatewayIntent, GatewayRefund, PaymentGateway,
};
use crate::{config::PaymentsConfig, errors::ServiceError};

const STRIPE_API_VERSION: &str = "2023-10-16";

/// Stripe PaymentIntents API client
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    config: PaymentsConfig,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    status: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(config: &PaymentsConfig) -> Result<Self, ServiceError> {
        let secret_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::InternalError("stripe api key is not configured".to_string())
            })?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            secret_key,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.secret_key)
            .header("Stripe-Version", STRIPE_API_VERSION)
    }

    /// Sends a request and decodes a 2xx body. Every other outcome becomes
    /// a `GatewayError`.
    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = self.authorized(request).send().await.map_err(|e| {
            counter!("storefront_gateway_errors_total", 1, "operation" => operation);
            if e.is_timeout() {
                warn!(operation, "Stripe request timed out");
                ServiceError::gateway(format!("{} timed out", operation))
            } else {
                error!(operation, error = %e, "Stripe transport error");
                ServiceError::gateway(format!("{} failed: {}", operation, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            counter!("storefront_gateway_errors_total", 1, "operation" => operation);
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<StripeErrorBody>(&body)
                .ok()
                .map(|b| {
                    format!(
                        "{}: {}",
                        b.error.code.unwrap_or_else(|| "error".into()),
                        b.error.message.unwrap_or_default()
                    )
                })
                .unwrap_or(body);
            error!(operation, status = %status, detail = %detail, "Stripe API error");
            return Err(ServiceError::gateway(describe_status(operation, status, &detail)));
        }

        response.json::<T>().await.map_err(|e| {
            counter!("storefront_gateway_errors_total", 1, "operation" => operation);
            error!(operation, error = %e, "Failed to decode Stripe response");
            ServiceError::gateway(format!("{}: undecodable response", operation))
        })
    }
}

fn describe_status(operation: &str, status: StatusCode, detail: &str) -> String {
    format!("{} returned {}: {}", operation, status.as_u16(), detail)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, request), fields(amount = request.amount, currency = %request.currency))]
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, ServiceError> {
        ensure_minimum_amount(&self.config, request.amount, &request.currency)?;

        let mut params: Vec<(String, String)> = vec![
            ("amount".into(), request.amount.to_string()),
            ("currency".into(), request.currency.to_ascii_lowercase()),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
        ];
        if let Some(description) = &request.description {
            params.push(("description".into(), description.clone()));
        }
        if let Some(customer) = &request.customer_ref {
            params.push(("customer".into(), customer.clone()));
        }
        let mut metadata: Vec<_> = request.metadata.iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }

        let mut builder = self.client.post(self.url("payment_intents")).form(&params);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let intent: PaymentIntentResponse = self.send("create_intent", builder).await?;
        let client_secret = intent.client_secret.ok_or_else(|| {
            ServiceError::gateway("create_intent: response did not include a client secret")
        })?;

        info!(external_id = %intent.id, status = %intent.status, "Payment intent created");
        Ok(GatewayIntent {
            external_id: intent.id,
            client_secret,
            status: ExternalPaymentStatus::parse(&intent.status),
        })
    }

    #[instrument(skip(self))]
    async fn retrieve(&self, external_id: &str) -> Result<ExternalPaymentStatus, ServiceError> {
        let builder = self
            .client
            .get(self.url(&format!("payment_intents/{}", external_id)));
        let intent: PaymentIntentResponse = self.send("retrieve_intent", builder).await?;
        debug!(status = %intent.status, "Payment intent retrieved");
        Ok(ExternalPaymentStatus::parse(&intent.status))
    }

    #[instrument(skip(self))]
    async fn confirm(&self, external_id: &str) -> Result<ExternalPaymentStatus, ServiceError> {
        let builder = self
            .client
            .post(self.url(&format!("payment_intents/{}/confirm", external_id)))
            .form(&Vec::<(String, String)>::new());
        let intent: PaymentIntentResponse = self.send("confirm_intent", builder).await?;
        Ok(ExternalPaymentStatus::parse(&intent.status))
    }

    #[instrument(skip(self, idempotency_key))]
    async fn refund(
        &self,
        external_id: &str,
        amount: Option<i64>,
        idempotency_key: Option<String>,
    ) -> Result<GatewayRefund, ServiceError> {
        let mut params: Vec<(String, String)> =
            vec![("payment_intent".into(), external_id.to_string())];
        if let Some(amount) = amount {
            params.push(("amount".into(), amount.to_string()));
        }

        let mut builder = self.client.post(self.url("refunds")).form(&params);
        if let Some(key) = &idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let refund: RefundResponse = self.send("create_refund", builder).await?;
        info!(external_refund_id = %refund.id, status = %refund.status, "Refund created");
        Ok(GatewayRefund {
            external_refund_id: refund.id,
            status: ExternalRefundStatus::parse(&refund.status),
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_refund(
        &self,
        external_refund_id: &str,
    ) -> Result<ExternalRefundStatus, ServiceError> {
        let builder = self
            .client
            .get(self.url(&format!("refunds/{}", external_refund_id)));
        let refund: RefundResponse = self.send("retrieve_refund", builder).await?;
        Ok(ExternalRefundStatus::parse(&refund.status))
    }

    #[instrument(skip(self, customer))]
    async fn create_customer(&self, customer: GatewayCustomer) -> Result<String, ServiceError> {
        let mut params: Vec<(String, String)> = vec![("email".into(), customer.email)];
        if let Some(name) = customer.name {
            params.push(("name".into(), name));
        }
        if let Some(phone) = customer.phone {
            params.push(("phone".into(), phone));
        }

        let builder = self.client.post(self.url("customers")).form(&params);
        let created: CustomerResponse = self.send("create_customer", builder).await?;
        Ok(created.id)
    }
}
