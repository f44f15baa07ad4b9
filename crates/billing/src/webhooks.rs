//! Gateway webhook handling
//!
//! Push-side twin of the polled reader: verifies the signature, claims the
//! event atomically and hands it to the shared reconciliation logic.
//!
//! Verification tries the SDK's parser first and falls back to a manual
//! check of the `Stripe-Signature` header (timestamp + v1 HMAC), which
//! keeps webhook intake working across gateway API-version skew.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, Webhook};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::event_reader::{apply_gateway_event, claim_event, mark_event};
use crate::payments::PaymentService;
use crate::router::OutcomeRouter;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the signature timestamp and now.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    payments: PaymentService,
    router: OutcomeRouter,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        pool: PgPool,
        payments: PaymentService,
        router: OutcomeRouter,
    ) -> Self {
        Self {
            stripe,
            pool,
            payments,
            router,
        }
    }

    /// Verify and parse a webhook payload.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(error = %e, "standard webhook parsing failed, verifying manually");
            }
        }

        let (timestamp, v1) = parse_signature_header(signature)?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            tracing::error!(timestamp = timestamp, now = now, "webhook timestamp out of tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1 {
            tracing::error!("webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(error = %e, "failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Handle a verified event. The atomic claim makes redelivery and the
    /// race against the polled reader harmless.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();

        if !claim_event(
            &self.pool,
            &event_id,
            &event.type_.to_string(),
            event.created,
        )
        .await?
        {
            tracing::info!(
                event_id = %event_id,
                event_type = %event.type_,
                "duplicate webhook event"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event.type_,
            "processing webhook event"
        );

        let result = apply_gateway_event(&self.payments, &self.router, &event).await;
        match &result {
            Ok(_) => mark_event(&self.pool, &event_id, None).await,
            Err(e) => mark_event(&self.pool, &event_id, Some(&e.to_string())).await,
        }
        result.map(|_| ())
    }
}

/// Parse `t=<unix>,v1=<hex>` out of the signature header.
fn parse_signature_header(signature: &str) -> BillingResult<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<String> = None;

    for part in signature.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, v1) {
        (Some(t), Some(v)) => Ok((t, v)),
        _ => {
            tracing::error!("malformed webhook signature header");
            Err(BillingError::WebhookSignatureInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_header_parses() {
        let (t, v1) = parse_signature_header("t=1700000000,v1=abc123,v0=ignored").unwrap();
        assert_eq!(t, 1_700_000_000);
        assert_eq!(v1, "abc123");
    }

    #[test]
    fn missing_parts_rejected() {
        assert!(parse_signature_header("t=1700000000").is_err());
        assert!(parse_signature_header("v1=abc").is_err());
        assert!(parse_signature_header("").is_err());
    }
}
