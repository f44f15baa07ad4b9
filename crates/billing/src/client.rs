//! Stripe client wrapper
//!
//! All gateway I/O goes through here. Every mutating call carries an explicit
//! idempotency key derived from the customer's stable seed plus a retry
//! token, so a crash-and-retry of the same logical step cannot double-charge
//! or double-create a resource.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use parley_shared::Cents;
use stripe::{
    CancelPaymentIntent, CreateCustomer, CreatePaymentIntent, Currency, Customer, CustomerId,
    Event, ListEvents, PaymentIntent, PaymentIntentId, PaymentIntentOffSession,
    PaymentIntentStatus, PaymentMethod, PaymentMethodId, RequestStrategy,
};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Gateway configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY must be set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET must be set".to_string()))?;
        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// What a single off-session charge attempt came back as.
///
/// `Declined` covers every retryable failure (card declined, rate limited);
/// anything the classifier cannot place is rethrown as an error instead.
#[derive(Debug, Clone)]
pub enum ChargeAttempt {
    Succeeded { intent_id: String },
    /// The user must authenticate. The intent id is missing when the
    /// gateway rejected the confirm before handing one back.
    NeedsAction { intent_id: Option<String> },
    Declined { intent_id: Option<String>, reason: String },
    /// The gateway is still processing; neither success nor failure yet.
    Processing { intent_id: String },
}

/// Classification of a gateway error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeErrorClass {
    /// Card declined, rate limited: retry later.
    Retryable,
    /// Authentication required: the user must act.
    NeedsAction,
    /// Not a charge failure; rethrow.
    Unknown,
}

/// Decide whether a Stripe error is a retryable decline, a user-action
/// requirement, or something unknown that must be rethrown.
pub fn classify_charge_error(err: &stripe::StripeError) -> ChargeErrorClass {
    match err {
        stripe::StripeError::Stripe(req) => {
            if req.http_status == 429 {
                return ChargeErrorClass::Retryable;
            }
            if req.decline_code.as_deref() == Some("authentication_required") {
                return ChargeErrorClass::NeedsAction;
            }
            if matches!(req.error_type, stripe::ErrorType::Card) {
                return ChargeErrorClass::Retryable;
            }
            ChargeErrorClass::Unknown
        }
        _ => ChargeErrorClass::Unknown,
    }
}

/// Idempotency key for a gateway call: stable seed + scope + retry token.
pub fn idempotency_key(seed: &str, scope: &str, entity: Uuid, token: i32) -> String {
    format!("{seed}:{scope}:{entity}:{token}")
}

/// Shared Stripe client.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn idempotent(&self, key: String) -> stripe::Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key))
    }

    /// Create a gateway customer for a user. Keyed on the user's idempotency
    /// seed so repeated calls return the same customer.
    pub async fn create_customer(&self, user_id: Uuid, seed: &str) -> BillingResult<String> {
        let client = self.idempotent(idempotency_key(seed, "customer", user_id, 0));

        let mut params = CreateCustomer::new();
        let metadata: HashMap<String, String> =
            HashMap::from([("user_id".to_string(), user_id.to_string())]);
        params.metadata = Some(metadata);

        let customer = Customer::create(&client, params).await?;
        Ok(customer.id.to_string())
    }

    pub async fn attach_payment_method(
        &self,
        customer_id: &str,
        method_id: &str,
    ) -> BillingResult<()> {
        let customer = CustomerId::from_str(customer_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;
        let method = PaymentMethodId::from_str(method_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment method ID: {}", e)))?;

        PaymentMethod::attach(
            &self.client,
            &method,
            stripe::AttachPaymentMethod { customer },
        )
        .await?;
        Ok(())
    }

    pub async fn detach_payment_method(&self, method_id: &str) -> BillingResult<()> {
        let method = PaymentMethodId::from_str(method_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment method ID: {}", e)))?;
        PaymentMethod::detach(&self.client, &method).await?;
        Ok(())
    }

    /// Create and confirm an off-session charge against the user's default
    /// card, classifying the result. Unknown gateway errors are rethrown.
    pub async fn charge_off_session(
        &self,
        amount: Cents,
        customer_id: &str,
        method_id: &str,
        payment_id: Uuid,
        seed: &str,
        attempt: i32,
    ) -> BillingResult<ChargeAttempt> {
        let customer = CustomerId::from_str(customer_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;
        let method = PaymentMethodId::from_str(method_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment method ID: {}", e)))?;

        let client = self.idempotent(idempotency_key(seed, "intent", payment_id, attempt));

        let mut params = CreatePaymentIntent::new(amount, Currency::USD);
        params.customer = Some(customer);
        params.payment_method = Some(method);
        params.confirm = Some(true);
        params.off_session = Some(PaymentIntentOffSession::Exists(true));
        params.metadata = Some(HashMap::from([(
            "payment_id".to_string(),
            payment_id.to_string(),
        )]));

        match PaymentIntent::create(&client, params).await {
            Ok(intent) => Ok(Self::classify_intent(&intent)),
            Err(err) => match classify_charge_error(&err) {
                ChargeErrorClass::Retryable => Ok(ChargeAttempt::Declined {
                    intent_id: None,
                    reason: err.to_string(),
                }),
                ChargeErrorClass::NeedsAction => {
                    Ok(ChargeAttempt::NeedsAction { intent_id: None })
                }
                ChargeErrorClass::Unknown => Err(err.into()),
            },
        }
    }

    /// Re-check an intent from an earlier attempt.
    pub async fn retrieve_intent(&self, intent_id: &str) -> BillingResult<ChargeAttempt> {
        let id = PaymentIntentId::from_str(intent_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment intent ID: {}", e)))?;
        let intent = PaymentIntent::retrieve(&self.client, &id, &[]).await?;
        Ok(Self::classify_intent(&intent))
    }

    pub async fn cancel_intent(&self, intent_id: &str) -> BillingResult<()> {
        let id = PaymentIntentId::from_str(intent_id)
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment intent ID: {}", e)))?;
        PaymentIntent::cancel(&self.client, &id, CancelPaymentIntent::default()).await?;
        Ok(())
    }

    /// List gateway events created at or after `cutoff` (unix seconds). The
    /// overlap at the cutoff second is deliberate; the claim table dedupes.
    pub async fn list_events_since(&self, cutoff: i64, limit: u64) -> BillingResult<Vec<Event>> {
        let mut params = ListEvents::new();
        params.created = Some(stripe::RangeQuery::Bounds(stripe::RangeBounds {
            gt: None,
            gte: Some(cutoff),
            lt: None,
            lte: None,
        }));
        params.limit = Some(limit);

        let page = Event::list(&self.client, &params).await?;
        Ok(page.data)
    }

    fn classify_intent(intent: &PaymentIntent) -> ChargeAttempt {
        let intent_id = intent.id.to_string();
        match intent.status {
            PaymentIntentStatus::Succeeded => ChargeAttempt::Succeeded { intent_id },
            PaymentIntentStatus::RequiresAction => ChargeAttempt::NeedsAction {
                intent_id: Some(intent_id),
            },
            PaymentIntentStatus::Processing => ChargeAttempt::Processing { intent_id },
            PaymentIntentStatus::RequiresPaymentMethod
            | PaymentIntentStatus::RequiresConfirmation
            | PaymentIntentStatus::RequiresCapture
            | PaymentIntentStatus::Canceled => ChargeAttempt::Declined {
                intent_id: Some(intent_id),
                reason: format!("intent ended in status {:?}", intent.status),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_are_stable_per_attempt() {
        let entity = Uuid::new_v4();
        let a = idempotency_key("seed-1", "intent", entity, 1);
        let b = idempotency_key("seed-1", "intent", entity, 1);
        let c = idempotency_key("seed-1", "intent", entity, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("seed-1:intent:"));
    }

    #[test]
    fn different_scopes_never_collide() {
        let entity = Uuid::new_v4();
        assert_ne!(
            idempotency_key("s", "intent", entity, 0),
            idempotency_key("s", "customer", entity, 0)
        );
    }
}
