//! Payment execution scheduler
//!
//! Drives pending payments to completion through the gateway. A poll pass
//! claims eligible payments one by one with an atomic conditional update
//! that bumps the attempt counter; the execution step then charges the
//! user's default card off-session and classifies the result. Completion
//! writes back through the same attempt number: if a newer attempt has
//! already been claimed, the write is discarded (stale-write guard).
//!
//! Backoff: the first two failures retry immediately on the next poll, after
//! that a one-hour cooldown applies. Attempts stuck `in_progress` for over
//! 30 minutes are reclaimed.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use parley_shared::PaymentOutcome;
use sqlx::PgPool;

use crate::client::{ChargeAttempt, StripeClient};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::payments::{Payment, PaymentService, PaymentState};
use crate::router::OutcomeRouter;
use crate::subscriptions::SubscriptionService;

/// Failures retried without any cooldown.
pub const IMMEDIATE_FAILURES: i32 = 2;
/// Cooldown between attempts once the immediate retries are spent.
pub const RETRY_COOLDOWN: Duration = Duration::hours(1);
/// After this long, an `in_progress` claim is considered abandoned.
pub const STUCK_CLAIM_RECOVERY: Duration = Duration::minutes(30);

/// Whether a payment with this failure history is due for another attempt.
pub fn should_attempt(
    failures_count: i32,
    last_failure_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    if failures_count < IMMEDIATE_FAILURES {
        return true;
    }
    match last_failure_at {
        None => true,
        Some(at) => now >= at + RETRY_COOLDOWN,
    }
}

/// Per-payment scheduling record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentScheduling {
    pub payment_id: Uuid,
    pub attempt: i32,
    pub failures_count: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub in_progress: bool,
    pub in_progress_since: Option<OffsetDateTime>,
}

/// A claimed execution task: payment plus the attempt it was dispatched with.
#[derive(Debug, Clone, Copy)]
pub struct ClaimedAttempt {
    pub payment_id: Uuid,
    pub attempt: i32,
}

#[derive(Clone)]
pub struct PaymentScheduler {
    pool: PgPool,
    stripe: StripeClient,
    payments: PaymentService,
    customers: CustomerService,
    subscriptions: SubscriptionService,
    router: OutcomeRouter,
}

impl PaymentScheduler {
    pub fn new(
        pool: PgPool,
        stripe: StripeClient,
        payments: PaymentService,
        customers: CustomerService,
        subscriptions: SubscriptionService,
        router: OutcomeRouter,
    ) -> Self {
        Self {
            pool,
            stripe,
            payments,
            customers,
            subscriptions,
            router,
        }
    }

    pub async fn get_scheduling(&self, payment_id: Uuid) -> BillingResult<PaymentScheduling> {
        let row: Option<PaymentScheduling> = sqlx::query_as(
            "SELECT payment_id, attempt, failures_count, last_failure_at, \
                    in_progress, in_progress_since \
             FROM payment_scheduling WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("scheduling for payment {payment_id}")))
    }

    /// One poll pass: claim every eligible pending payment and execute the
    /// claimed attempts. Per-payment failures are logged, not fatal to the
    /// pass.
    pub async fn run_once(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let claims = self.poll(100).await?;
        let claimed = claims.len();

        for claim in claims {
            if let Err(e) = self.execute_attempt(claim, now).await {
                tracing::error!(
                    payment_id = %claim.payment_id,
                    attempt = claim.attempt,
                    error = %e,
                    "payment attempt failed"
                );
            }
        }
        Ok(claimed)
    }

    /// Claim eligible payments. Each claim is a single conditional update
    /// that flips `in_progress` and bumps `attempt`; losers of a race simply
    /// match zero rows.
    pub async fn poll(&self, limit: i64) -> BillingResult<Vec<ClaimedAttempt>> {
        let candidates: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT ps.payment_id \
             FROM payment_scheduling ps \
             JOIN payments p ON p.id = ps.payment_id \
             WHERE p.state IN ('pending', 'failing') \
               AND (NOT ps.in_progress \
                    OR ps.in_progress_since < NOW() - INTERVAL '30 minutes') \
               AND (ps.failures_count < 2 \
                    OR ps.last_failure_at IS NULL \
                    OR ps.last_failure_at < NOW() - INTERVAL '1 hour') \
             ORDER BY p.created_at \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claims = Vec::with_capacity(candidates.len());
        for (payment_id,) in candidates {
            let claimed: Option<(i32,)> = sqlx::query_as(
                "UPDATE payment_scheduling \
                 SET in_progress = TRUE, in_progress_since = NOW(), attempt = attempt + 1 \
                 WHERE payment_id = $1 \
                   AND (NOT in_progress \
                        OR in_progress_since < NOW() - INTERVAL '30 minutes') \
                 RETURNING attempt",
            )
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((attempt,)) = claimed {
                claims.push(ClaimedAttempt {
                    payment_id,
                    attempt,
                });
            }
        }
        Ok(claims)
    }

    /// Execute one claimed attempt end to end.
    async fn execute_attempt(&self, claim: ClaimedAttempt, now: OffsetDateTime) -> BillingResult<()> {
        let result = self.attempt_charge(claim).await;

        match result {
            Ok(failed) => self.complete(claim, failed, now).await,
            Err(e) => {
                // Unknown gateway errors are rethrown after the claim is
                // released; nothing is recorded as a decline.
                self.complete(claim, false, now).await?;
                Err(e)
            }
        }
    }

    /// Returns whether the attempt ended in a retryable failure.
    async fn attempt_charge(&self, claim: ClaimedAttempt) -> BillingResult<bool> {
        let payment = self.payments.get_payment(claim.payment_id).await?;
        if payment.state()?.is_terminal() {
            return Ok(false);
        }

        // Re-check an intent left over from an earlier attempt before
        // creating a new one.
        if let Some(intent_id) = payment.intent_id.clone() {
            let polled = self.stripe.retrieve_intent(&intent_id).await?;
            match polled {
                ChargeAttempt::Succeeded { .. } | ChargeAttempt::NeedsAction { .. } => {
                    return self.apply_attempt(&payment, polled).await;
                }
                ChargeAttempt::Processing { .. } => return Ok(false),
                ChargeAttempt::Declined { .. } => {
                    // Dead intent: cancel it and charge afresh below.
                    if let Err(e) = self.stripe.cancel_intent(&intent_id).await {
                        tracing::warn!(intent_id = %intent_id, error = %e,
                            "failed to cancel dead intent");
                    }
                    self.payments.intent_cancel(&intent_id).await?;
                }
            }
        }

        let customer = self.customers.get_customer(payment.user_id).await?;
        let customer_id = self.customers.ensure_customer_id(payment.user_id).await?;
        let Some(method_id) = self
            .customers
            .default_payment_method(payment.user_id)
            .await?
        else {
            tracing::warn!(
                payment_id = %payment.id,
                user_id = %payment.user_id,
                "no default payment method, treating attempt as failed"
            );
            return self
                .apply_attempt(
                    &payment,
                    ChargeAttempt::Declined {
                        intent_id: None,
                        reason: "no default payment method".to_string(),
                    },
                )
                .await;
        };

        let outcome = self
            .stripe
            .charge_off_session(
                payment.amount,
                &customer_id,
                &method_id,
                payment.id,
                &customer.idempotency_seed,
                claim.attempt,
            )
            .await?;

        self.apply_attempt(&payment, outcome).await
    }

    /// Record the classified gateway result and route the outcome. Returns
    /// whether it counts as a retryable failure.
    async fn apply_attempt(
        &self,
        payment: &Payment,
        result: ChargeAttempt,
    ) -> BillingResult<bool> {
        match result {
            ChargeAttempt::Succeeded { intent_id } => {
                self.record_intent(payment, &intent_id).await?;
                // The boolean guards against a webhook having settled this
                // intent already.
                if self.payments.intent_success(&intent_id).await? {
                    self.payments
                        .set_state(payment.id, PaymentState::Success)
                        .await?;
                    self.router.route(payment, PaymentOutcome::Success).await?;
                }
                Ok(false)
            }
            ChargeAttempt::NeedsAction { intent_id } => {
                if let Some(intent_id) = intent_id {
                    self.record_intent(payment, &intent_id).await?;
                }
                self.payments
                    .set_state(payment.id, PaymentState::ActionRequired)
                    .await?;
                self.router
                    .route(payment, PaymentOutcome::ActionNeeded)
                    .await?;
                Ok(false)
            }
            ChargeAttempt::Processing { intent_id } => {
                self.record_intent(payment, &intent_id).await?;
                Ok(false)
            }
            ChargeAttempt::Declined { intent_id, reason } => {
                if let Some(intent_id) = intent_id {
                    self.record_intent(payment, &intent_id).await?;
                    self.payments.intent_cancel(&intent_id).await?;
                }
                tracing::info!(
                    payment_id = %payment.id,
                    reason = %reason,
                    "charge declined"
                );
                self.payments
                    .set_state(payment.id, PaymentState::Failing)
                    .await?;
                self.router.route(payment, PaymentOutcome::Failing).await?;
                Ok(true)
            }
        }
    }

    /// Register the intent (first sighting only) and link it to the payment.
    async fn record_intent(&self, payment: &Payment, intent_id: &str) -> BillingResult<()> {
        match self
            .payments
            .register_intent(intent_id, payment.amount, payment.operation())
            .await
        {
            Ok(()) => {}
            Err(BillingError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        if payment.intent_id.as_deref() != Some(intent_id) {
            self.payments.attach_intent(payment.id, intent_id).await?;
        }
        Ok(())
    }

    /// Write back the attempt result, guarded by the attempt number: if a
    /// newer attempt was claimed meanwhile, this result is stale and is
    /// discarded.
    async fn complete(
        &self,
        claim: ClaimedAttempt,
        failed: bool,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            "UPDATE payment_scheduling \
             SET in_progress = FALSE, \
                 in_progress_since = NULL, \
                 failures_count = failures_count + CASE WHEN $3 THEN 1 ELSE 0 END, \
                 last_failure_at = CASE WHEN $3 THEN $4 ELSE last_failure_at END \
             WHERE payment_id = $1 AND attempt = $2",
        )
        .bind(claim.payment_id)
        .bind(claim.attempt)
        .bind(failed)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            tracing::debug!(
                payment_id = %claim.payment_id,
                attempt = claim.attempt,
                "stale attempt result discarded"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Cooperative cancellation sweep
    // =========================================================================

    /// Cancel in-flight payments of periods flagged `need_cancel`. Each
    /// period is claimed at most once; the gateway intent is canceled first,
    /// then the canceled outcome is routed.
    pub async fn sweep_cancellations(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let pending = self.subscriptions.periods_awaiting_cancel(100).await?;
        let mut canceled = 0;

        for entry in pending {
            if !self
                .subscriptions
                .claim_cancellation(entry.subscription_id, entry.period_index)
                .await?
            {
                continue;
            }

            let Some(payment_id) = entry.payment_id else {
                tracing::warn!(
                    subscription_id = %entry.subscription_id,
                    period_index = entry.period_index,
                    "period flagged for cancellation has no payment"
                );
                self.subscriptions
                    .payment_canceled(entry.subscription_id, entry.period_index, now)
                    .await?;
                continue;
            };

            if let Err(e) = self.cancel_payment(payment_id).await {
                tracing::error!(
                    payment_id = %payment_id,
                    error = %e,
                    "payment cancellation failed"
                );
                continue;
            }
            canceled += 1;
        }
        Ok(canceled)
    }

    async fn cancel_payment(&self, payment_id: Uuid) -> BillingResult<()> {
        let payment = self.payments.get_payment(payment_id).await?;
        if payment.state()?.is_terminal() {
            return Ok(());
        }

        if let Some(intent_id) = payment.intent_id.clone() {
            // Gateway first. If the intent already succeeded there, this
            // errors and the success event reconciles the period instead.
            self.stripe.cancel_intent(&intent_id).await?;
            self.payments.intent_cancel(&intent_id).await?;
        }

        self.payments
            .set_state(payment.id, PaymentState::Canceled)
            .await?;
        self.router.route(&payment, PaymentOutcome::Canceled).await?;
        tracing::info!(payment_id = %payment_id, "in-flight payment canceled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn first_two_failures_retry_immediately() {
        let now = datetime!(2024-05-01 10:00 UTC);
        assert!(should_attempt(0, None, now));
        assert!(should_attempt(1, Some(now - Duration::seconds(5)), now));
    }

    #[test]
    fn later_failures_wait_for_the_cooldown() {
        let now = datetime!(2024-05-01 10:00 UTC);
        assert!(!should_attempt(2, Some(now - Duration::minutes(59)), now));
        assert!(should_attempt(2, Some(now - Duration::hours(1)), now));
        assert!(should_attempt(5, Some(now - Duration::hours(2)), now));
    }

    #[test]
    fn missing_failure_timestamp_allows_attempt() {
        let now = datetime!(2024-05-01 10:00 UTC);
        assert!(should_attempt(10, None, now));
    }
}
