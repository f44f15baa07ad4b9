// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Parley Billing
//!
//! Off-session payments and subscription billing for the wallet ledger.
//!
//! ## Features
//!
//! - **Payments**: payment + gateway-intent registry with retry-key
//!   idempotency and one-way intent transitions
//! - **Customers**: gateway customer plumbing and card management (at most
//!   one default card per user)
//! - **Subscriptions**: period state machines, grace periods, retries and
//!   time-driven scheduling
//! - **Routing**: single dispatch point from gateway outcomes to ledger and
//!   engine transitions
//! - **Execution**: background retry loop driving pending payments through
//!   the gateway with backoff and a stale-attempt guard
//! - **Reconciliation**: webhook and polled-event paths that never
//!   double-apply or lose an outcome
//! - **Invariants**: runnable SQL consistency checks

pub mod client;
pub mod customer;
pub mod error;
pub mod event_reader;
pub mod invariants;
pub mod lifecycle;
pub mod payments;
pub mod router;
pub mod scheduler;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{ChargeAttempt, ChargeErrorClass, StripeClient, StripeConfig};

// Customer
pub use customer::{BillingCustomer, CustomerService, StoredPaymentMethod};

// Error
pub use error::{BillingError, BillingResult};

// Event reader
pub use event_reader::{outcome_for_event, GatewayEventReader, READER_VERSION};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{
    grace_deadline, outcome_effect, period_end, BillingInterval, OutcomeEffect, PeriodState,
    SubscriptionState,
};

// Payments
pub use payments::{NewPayment, Payment, PaymentIntentRecord, PaymentService, PaymentState};

// Router
pub use router::OutcomeRouter;

// Scheduler
pub use scheduler::{should_attempt, ClaimedAttempt, PaymentScheduler, PaymentScheduling};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionPeriod, SubscriptionService};

// Webhooks
pub use webhooks::WebhookHandler;

use std::sync::Arc;

use parley_shared::{
    ensure_amount, Cents, Operation, UpdateNotifier, MIN_CHARGE_CENTS,
};
use parley_wallet::{allocate, Wallet, WalletService, WalletTransaction};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// Everything the API layer calls into, wired once at startup.
#[derive(Clone)]
pub struct BillingService {
    pub wallet: WalletService,
    pub customers: CustomerService,
    pub payments: PaymentService,
    pub subscriptions: SubscriptionService,
    pub router: OutcomeRouter,
    pub scheduler: PaymentScheduler,
    pub events: GatewayEventReader,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create the billing service from environment variables.
    pub fn from_env(pool: PgPool, notifier: Arc<dyn UpdateNotifier>) -> BillingResult<Self> {
        Ok(Self::new(StripeClient::from_env()?, pool, notifier))
    }

    /// Create the billing service with an explicit gateway client.
    pub fn new(stripe: StripeClient, pool: PgPool, notifier: Arc<dyn UpdateNotifier>) -> Self {
        let wallet = WalletService::new(pool.clone(), notifier.clone());
        let payments = PaymentService::new(pool.clone(), wallet.clone(), notifier);
        let customers = CustomerService::new(stripe.clone(), pool.clone());
        let subscriptions =
            SubscriptionService::new(pool.clone(), wallet.clone(), payments.clone());
        let router = OutcomeRouter::new(wallet.clone(), subscriptions.clone());
        let scheduler = PaymentScheduler::new(
            pool.clone(),
            stripe.clone(),
            payments.clone(),
            customers.clone(),
            subscriptions.clone(),
            router.clone(),
        );
        let events = GatewayEventReader::new(
            pool.clone(),
            stripe.clone(),
            payments.clone(),
            router.clone(),
        );
        let webhooks = WebhookHandler::new(stripe, pool, payments.clone(), router.clone());

        Self {
            wallet,
            customers,
            payments,
            subscriptions,
            router,
            scheduler,
            events,
            webhooks,
        }
    }

    // =========================================================================
    // Caller-facing flows
    // =========================================================================

    /// Deposit charged through the gateway: pending ledger transaction plus
    /// one payment. Idempotent by `retry_key` when supplied.
    pub async fn create_deposit(
        &self,
        user_id: Uuid,
        amount: Cents,
        retry_key: Option<String>,
    ) -> BillingResult<Payment> {
        ensure_amount(amount)?;
        if amount < MIN_CHARGE_CENTS {
            return Err(BillingError::Validation(format!(
                "deposit amount must be at least {MIN_CHARGE_CENTS}, got {amount}"
            )));
        }

        if let Some(key) = retry_key.as_deref() {
            if let Some(existing) = self.payments.find_by_retry_key(key).await? {
                return Ok(existing);
            }
        }

        let payment_id = Uuid::new_v4();
        let record = self.wallet.deposit_pending(user_id, amount, payment_id).await?;
        let (payment, created) = self
            .payments
            .create_payment(NewPayment {
                id: payment_id,
                user_id,
                amount,
                operation: Operation::Deposit {
                    amount,
                    payment_id: None,
                },
                tx_id: Some(record.id),
                retry_key,
            })
            .await?;

        if !created {
            // Lost a retry-key race: the transaction created above is orphaned.
            self.wallet.deposit_cancel(user_id, record.id).await?;
        }
        Ok(payment)
    }

    /// Deposit settled immediately (promotional credit, admin grant).
    pub async fn create_deposit_instant(
        &self,
        user_id: Uuid,
        amount: Cents,
    ) -> BillingResult<WalletTransaction> {
        Ok(self.wallet.deposit_instant(user_id, amount).await?)
    }

    /// Transfer to another user. Fully wallet-covered transfers settle
    /// immediately and return no payment; otherwise the remainder is charged
    /// off-session.
    pub async fn create_transfer(
        &self,
        from: Uuid,
        to: Uuid,
        amount: Cents,
        retry_key: Option<String>,
    ) -> BillingResult<Option<Payment>> {
        let wallet = self.wallet.get_wallet(from).await?;
        let split = allocate(wallet.available(), amount)?;

        if split.charge_amount == 0 {
            self.wallet.transfer_balance(from, to, amount).await?;
            return Ok(None);
        }

        if let Some(key) = retry_key.as_deref() {
            if let Some(existing) = self.payments.find_by_retry_key(key).await? {
                return Ok(Some(existing));
            }
        }

        let payment_id = Uuid::new_v4();
        let (out_record, in_record) = self
            .wallet
            .transfer_pending(
                from,
                to,
                split.balance_amount,
                split.charge_amount,
                payment_id,
            )
            .await?;
        let (payment, created) = self
            .payments
            .create_payment(NewPayment {
                id: payment_id,
                user_id: from,
                amount: split.charge_amount,
                operation: Operation::TransferOut {
                    to,
                    twin: in_record.id,
                    balance_amount: split.balance_amount,
                    charge_amount: split.charge_amount,
                    payment_id: None,
                },
                tx_id: Some(out_record.id),
                retry_key,
            })
            .await?;

        if !created {
            self.wallet.transfer_cancel(from, out_record.id).await?;
        }
        Ok(Some(payment))
    }

    /// Subscribe to a product; the first period is charged right away.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        amount: Cents,
        interval: BillingInterval,
        product: &str,
    ) -> BillingResult<Subscription> {
        self.subscriptions
            .create_subscription(user_id, amount, interval, product, OffsetDateTime::now_utc())
            .await
    }

    /// One-off purchase. Fully wallet-covered purchases settle immediately
    /// and return no payment.
    pub async fn create_purchase(
        &self,
        user_id: Uuid,
        product: &str,
        amount: Cents,
        retry_key: Option<String>,
    ) -> BillingResult<Option<Payment>> {
        let wallet = self.wallet.get_wallet(user_id).await?;
        let split = allocate(wallet.available(), amount)?;

        if split.charge_amount == 0 {
            self.wallet.purchase_instant(user_id, product, amount).await?;
            return Ok(None);
        }

        if let Some(key) = retry_key.as_deref() {
            if let Some(existing) = self.payments.find_by_retry_key(key).await? {
                return Ok(Some(existing));
            }
        }

        let payment_id = Uuid::new_v4();
        let record = self
            .wallet
            .purchase_pending(user_id, product, split.balance_amount, split.charge_amount)
            .await?;
        let (payment, created) = self
            .payments
            .create_payment(NewPayment {
                id: payment_id,
                user_id,
                amount: split.charge_amount,
                operation: Operation::Purchase {
                    product: product.to_string(),
                    balance_amount: split.balance_amount,
                    charge_amount: split.charge_amount,
                },
                tx_id: Some(record.id),
                retry_key,
            })
            .await?;

        if !created {
            self.wallet.purchase_cancel(user_id, record.id).await?;
        }
        Ok(Some(payment))
    }

    // =========================================================================
    // Status queries
    // =========================================================================

    pub async fn wallet_balance(&self, user_id: Uuid) -> BillingResult<Wallet> {
        Ok(self.wallet.get_wallet(user_id).await?)
    }

    pub async fn failing_payment_count(&self, user_id: Uuid) -> BillingResult<i64> {
        self.payments.count_failing(user_id).await
    }

    pub async fn subscription_expiry_estimate(
        &self,
        sub_id: Uuid,
    ) -> BillingResult<OffsetDateTime> {
        self.subscriptions.expiry_estimate(sub_id).await
    }
}
