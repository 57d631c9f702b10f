use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::{
    errors::ServiceError,
    services::payment_gateway::ExternalPaymentStatus,
    AppState,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let payments_cfg = &state.config.payments;
    let verified = match payments_cfg.webhook_secret.as_deref() {
        Some(secret) => {
            if !verify_signature(&headers, &body, secret, payments_cfg.webhook_tolerance_secs) {
                warn!("Payment webhook signature verification failed");
                return Err(ServiceError::Unauthorized(
                    "invalid webhook signature".to_string(),
                ));
            }
            true
        }
        None => false,
    };

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let Some(suffix) = event.event_type.strip_prefix("payment_intent.") else {
        info!(event_type = %event.event_type, "Unhandled payment webhook type");
        return Ok((StatusCode::OK, "ok"));
    };

    let external_id = event.data.object.id.as_str();
    let payments = &state.services.payments;
    let result = if verified {
        // payment_failed carries requires_payment_method; the event type is the decline.
        let status = match suffix {
            "payment_failed" => ExternalPaymentStatus::Failed,
            _ => ExternalPaymentStatus::parse(event.data.object.status.as_deref().unwrap_or(suffix)),
        };
        payments.confirm(external_id, status).await
    } else {
        // Unsigned payloads are only a hint; the gateway has the final word.
        payments.confirm_reported(None, external_id, None).await
    };

    match result {
        Ok(outcome) => {
            info!(
                event_id = event.id.as_deref().unwrap_or("-"),
                %external_id,
                payment_status = %outcome.payment_status,
                applied = outcome.applied,
                "Payment webhook processed"
            );
            Ok((StatusCode::OK, "ok"))
        }
        Err(ServiceError::PaymentNotFound(_)) => {
            // Intents created outside this service are acknowledged and dropped.
            warn!(%external_id, "Webhook for unknown payment intent");
            Ok((StatusCode::OK, "ok"))
        }
        Err(e) => Err(e),
    }
}

fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str, tolerance_secs: u64) -> bool {
    // Generic HMAC: x-timestamp and x-signature headers
    let generic = (
        headers.get("x-timestamp").and_then(|h| h.to_str().ok()),
        headers.get("x-signature").and_then(|h| h.to_str().ok()),
    );
    if let (Some(ts), Some(sig)) = generic {
        return within_tolerance(ts, tolerance_secs)
            && expected_signature(secret, ts, payload).is_some_and(|expected| constant_time_eq(&expected, sig));
    }

    // Stripe-like support: Stripe-Signature with t=, v1=
    if let Some(sig) = headers.get("Stripe-Signature").and_then(|h| h.to_str().ok()) {
        let mut ts = "";
        let mut candidates = Vec::new();
        for part in sig.split(',') {
            match part.trim().split_once('=') {
                Some(("t", val)) => ts = val,
                Some(("v1", val)) => candidates.push(val),
                _ => {}
            }
        }
        if ts.is_empty() || candidates.is_empty() || !within_tolerance(ts, tolerance_secs) {
            return false;
        }
        return expected_signature(secret, ts, payload)
            .is_some_and(|expected| candidates.iter().any(|v1| constant_time_eq(&expected, v1)));
    }
    false
}

fn within_tolerance(ts: &str, tolerance_secs: u64) -> bool {
    match ts.parse::<i64>() {
        Ok(ts) => (chrono::Utc::now().timestamp() - ts).unsigned_abs() <= tolerance_secs,
        Err(_) => false,
    }
}

fn expected_signature(secret: &str, ts: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Signature header value for `payload`, as a sender would compute it.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    expected_signature(secret, &timestamp.to_string(), payload)
}
