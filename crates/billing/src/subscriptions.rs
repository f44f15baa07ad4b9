//! Subscription billing engine
//!
//! Subscriptions move through `started -> grace_period -> retrying ->
//! expired`, with a soft-cancel path `started -> canceled -> expired` and
//! recovery back to `started` from both `grace_period` and `retrying`.
//! Two independent inputs drive the machine: gateway outcomes for the
//! current period (routed here by the outcome router) and wall-clock
//! scheduling (`do_scheduling`, run by the worker).
//!
//! Periods are created by the engine, never deleted; a new one is only
//! created after the prior reached `success`. Charging a period produces
//! exactly one period row and, when a gateway charge is needed, exactly one
//! payment, enforced by a claim column with stuck-claim recovery.

use parley_shared::{ensure_amount, Cents, Operation, PaymentOutcome, MIN_CHARGE_CENTS};
use parley_wallet::{allocate, WalletService};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{
    grace_deadline, outcome_effect, period_end, BillingInterval, PeriodState, SubscriptionState,
    RENEW_WINDOW, RETRY_CANCEL_AFTER,
};
use crate::payments::{NewPayment, PaymentService};

/// One subscription row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Cents,
    pub interval: String,
    pub start_at: OffsetDateTime,
    pub product: String,
    pub state: String,
    pub current_period_index: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn state(&self) -> BillingResult<SubscriptionState> {
        SubscriptionState::parse(&self.state)
    }

    pub fn interval(&self) -> BillingResult<BillingInterval> {
        BillingInterval::parse(&self.interval)
    }
}

/// One billing period, keyed by `(subscription_id, period_index)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionPeriod {
    pub subscription_id: Uuid,
    pub period_index: i32,
    pub start_at: OffsetDateTime,
    pub state: String,
    pub payment_id: Option<Uuid>,
    pub tx_id: Option<Uuid>,
    pub need_cancel: bool,
    pub scheduled_cancel: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionPeriod {
    pub fn state(&self) -> BillingResult<PeriodState> {
        PeriodState::parse(&self.state)
    }
}

/// A period whose in-flight payment awaits cooperative cancellation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingCancellation {
    pub subscription_id: Uuid,
    pub period_index: i32,
    pub payment_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    wallet: WalletService,
    payments: PaymentService,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, wallet: WalletService, payments: PaymentService) -> Self {
        Self {
            pool,
            wallet,
            payments,
        }
    }

    /// Create a subscription with its first period and charge it.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        amount: Cents,
        interval: BillingInterval,
        product: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        ensure_amount(amount)?;
        if amount < MIN_CHARGE_CENTS {
            return Err(BillingError::Validation(format!(
                "subscription amount must be at least {MIN_CHARGE_CENTS}, got {amount}"
            )));
        }

        let sub_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO subscriptions \
                 (id, user_id, amount, interval, start_at, product, state, current_period_index) \
             VALUES ($1, $2, $3, $4, $5, $6, 'started', 1)",
        )
        .bind(sub_id)
        .bind(user_id)
        .bind(amount)
        .bind(interval.as_str())
        .bind(now)
        .bind(product)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO subscription_periods (subscription_id, period_index, start_at, state) \
             VALUES ($1, 1, $2, 'pending')",
        )
        .bind(sub_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub_id,
            user_id = %user_id,
            amount = amount,
            interval = %interval,
            product = product,
            "subscription created"
        );

        self.charge_pending_period(sub_id).await?;
        self.get_subscription(sub_id).await
    }

    pub async fn get_subscription(&self, sub_id: Uuid) -> BillingResult<Subscription> {
        let row: Option<Subscription> = sqlx::query_as(
            "SELECT id, user_id, amount, interval, start_at, product, state, \
                    current_period_index, created_at, updated_at \
             FROM subscriptions WHERE id = $1",
        )
        .bind(sub_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("subscription {sub_id}")))
    }

    pub async fn get_period(
        &self,
        sub_id: Uuid,
        period_index: i32,
    ) -> BillingResult<SubscriptionPeriod> {
        let row: Option<SubscriptionPeriod> = sqlx::query_as(
            "SELECT subscription_id, period_index, start_at, state, payment_id, tx_id, \
                    need_cancel, scheduled_cancel, created_at, updated_at \
             FROM subscription_periods WHERE subscription_id = $1 AND period_index = $2",
        )
        .bind(sub_id)
        .bind(period_index)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| {
            BillingError::NotFound(format!("period {period_index} of subscription {sub_id}"))
        })
    }

    /// Soft-cancel. `true` and a no-op if already canceled or expired;
    /// `false` while retrying (the subscription must reach terminal failure
    /// or recover naturally); otherwise moves to `canceled` and lets the
    /// current period run out.
    pub async fn try_cancel(&self, sub_id: Uuid) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, sub_id).await?;

        match sub.state()? {
            SubscriptionState::Canceled | SubscriptionState::Expired => Ok(true),
            SubscriptionState::Retrying => Ok(false),
            SubscriptionState::Started | SubscriptionState::GracePeriod => {
                set_subscription_state(&mut tx, sub_id, SubscriptionState::Canceled).await?;
                tx.commit().await?;
                tracing::info!(subscription_id = %sub_id, "subscription canceled");
                Ok(true)
            }
        }
    }

    /// When the subscription stops being billable, as shown to the user.
    pub async fn expiry_estimate(&self, sub_id: Uuid) -> BillingResult<OffsetDateTime> {
        let sub = self.get_subscription(sub_id).await?;
        let period = self.get_period(sub_id, sub.current_period_index).await?;
        let interval = sub.interval()?;

        Ok(match sub.state()? {
            SubscriptionState::Retrying => period.start_at + RETRY_CANCEL_AFTER,
            _ => period_end(period.start_at, interval),
        })
    }

    // =========================================================================
    // Payment outcomes (current period only)
    // =========================================================================

    pub async fn payment_succeeded(
        &self,
        sub_id: Uuid,
        period_index: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        self.apply_outcome(sub_id, period_index, PaymentOutcome::Success, now)
            .await
    }

    pub async fn payment_failing(
        &self,
        sub_id: Uuid,
        period_index: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        self.apply_outcome(sub_id, period_index, PaymentOutcome::Failing, now)
            .await
    }

    pub async fn payment_action_needed(
        &self,
        sub_id: Uuid,
        period_index: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        self.apply_outcome(sub_id, period_index, PaymentOutcome::ActionNeeded, now)
            .await
    }

    pub async fn payment_canceled(
        &self,
        sub_id: Uuid,
        period_index: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        self.apply_outcome(sub_id, period_index, PaymentOutcome::Canceled, now)
            .await
    }

    async fn apply_outcome(
        &self,
        sub_id: Uuid,
        period_index: i32,
        outcome: PaymentOutcome,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, sub_id).await?;

        if period_index != sub.current_period_index {
            // Stale or duplicate event for an old period: discard.
            tracing::warn!(
                subscription_id = %sub_id,
                period_index = period_index,
                current = sub.current_period_index,
                outcome = %outcome,
                "discarding outcome for a non-current period"
            );
            return Ok(());
        }

        let period = lock_period(&mut tx, sub_id, period_index).await?;
        let period_state = period.state()?;
        if period_state.is_terminal() {
            return Err(BillingError::InvalidState(format!(
                "period {period_index} of subscription {sub_id} is already {period_state}"
            )));
        }

        let state = sub.state()?;
        if outcome == PaymentOutcome::Canceled && state != SubscriptionState::Retrying {
            tracing::warn!(
                subscription_id = %sub_id,
                state = %state,
                "cancel outcome outside retrying"
            );
        }

        let effect = outcome_effect(state, outcome, period_index);

        if let Some(next) = effect.period_state {
            sqlx::query(
                "UPDATE subscription_periods SET state = $3, updated_at = NOW() \
                 WHERE subscription_id = $1 AND period_index = $2",
            )
            .bind(sub_id)
            .bind(period_index)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await?;
        }
        if effect.reset_period_start {
            sqlx::query(
                "UPDATE subscription_periods SET start_at = $3, updated_at = NOW() \
                 WHERE subscription_id = $1 AND period_index = $2",
            )
            .bind(sub_id)
            .bind(period_index)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(next) = effect.subscription_state {
            set_subscription_state(&mut tx, sub_id, next).await?;
        }
        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub_id,
            period_index = period_index,
            outcome = %outcome,
            period_state = ?effect.period_state,
            subscription_state = ?effect.subscription_state,
            "subscription outcome applied"
        );
        Ok(())
    }

    // =========================================================================
    // Time-driven scheduling
    // =========================================================================

    /// One scheduling pass over every live subscription. Idempotent and safe
    /// to call repeatedly; per-subscription failures are logged, not fatal.
    pub async fn do_scheduling(&self, now: OffsetDateTime) -> BillingResult<()> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM subscriptions \
             WHERE state IN ('started', 'grace_period', 'retrying', 'canceled')",
        )
        .fetch_all(&self.pool)
        .await?;

        for (sub_id,) in ids {
            if let Err(e) = self.tick(sub_id, now).await {
                tracing::error!(subscription_id = %sub_id, error = %e, "scheduling tick failed");
            }
            if let Err(e) = self.charge_pending_period(sub_id).await {
                tracing::error!(subscription_id = %sub_id, error = %e, "period charge failed");
            }
        }
        Ok(())
    }

    async fn tick(&self, sub_id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, sub_id).await?;
        let period = lock_period(&mut tx, sub_id, sub.current_period_index).await?;
        let interval = sub.interval()?;
        let end = period_end(period.start_at, interval);

        match sub.state()? {
            SubscriptionState::Canceled => {
                if now >= end {
                    set_subscription_state(&mut tx, sub_id, SubscriptionState::Expired).await?;
                    tx.commit().await?;
                    tracing::info!(subscription_id = %sub_id, "canceled subscription expired");
                }
            }
            SubscriptionState::GracePeriod => {
                if now >= grace_deadline(period.start_at, interval) {
                    set_subscription_state(&mut tx, sub_id, SubscriptionState::Retrying).await?;
                    tx.commit().await?;
                    tracing::info!(subscription_id = %sub_id, "grace period ran out, retrying");
                }
            }
            SubscriptionState::Retrying => {
                if now >= period.start_at + RETRY_CANCEL_AFTER && !period.need_cancel {
                    sqlx::query(
                        "UPDATE subscription_periods SET need_cancel = TRUE, updated_at = NOW() \
                         WHERE subscription_id = $1 AND period_index = $2",
                    )
                    .bind(sub_id)
                    .bind(sub.current_period_index)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    tracing::info!(
                        subscription_id = %sub_id,
                        period_index = sub.current_period_index,
                        "flagged in-flight payment for cancellation"
                    );
                }
            }
            SubscriptionState::Started => {
                let period_state = period.state()?;
                if sub.current_period_index == 1
                    && period_state != PeriodState::Success
                    && now >= end
                {
                    // The first payment never completed in time.
                    set_subscription_state(&mut tx, sub_id, SubscriptionState::Expired).await?;
                    tx.commit().await?;
                    tracing::info!(subscription_id = %sub_id, "first period unpaid, expired");
                } else if period_state == PeriodState::Success && now >= end - RENEW_WINDOW {
                    let next_index = sub.current_period_index + 1;
                    sqlx::query(
                        "INSERT INTO subscription_periods \
                             (subscription_id, period_index, start_at, state) \
                         VALUES ($1, $2, $3, 'pending')",
                    )
                    .bind(sub_id)
                    .bind(next_index)
                    .bind(end)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        "UPDATE subscriptions SET current_period_index = $2, updated_at = NOW() \
                         WHERE id = $1",
                    )
                    .bind(sub_id)
                    .bind(next_index)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    tracing::info!(
                        subscription_id = %sub_id,
                        period_index = next_index,
                        "next billing period created"
                    );
                }
            }
            SubscriptionState::Expired => {}
        }
        Ok(())
    }

    /// Charge the current period if it is still pending and unclaimed.
    /// Returns whether a charge was performed. The claim column makes this
    /// idempotent and recovers claims stuck for over 15 minutes.
    pub async fn charge_pending_period(&self, sub_id: Uuid) -> BillingResult<bool> {
        let claimed: Option<(i32, Cents, Uuid)> = sqlx::query_as(
            "UPDATE subscription_periods sp SET charge_claimed_at = NOW() \
             FROM subscriptions s \
             WHERE s.id = sp.subscription_id \
               AND sp.subscription_id = $1 \
               AND sp.period_index = s.current_period_index \
               AND sp.state = 'pending' \
               AND sp.tx_id IS NULL \
               AND sp.payment_id IS NULL \
               AND (sp.charge_claimed_at IS NULL \
                    OR sp.charge_claimed_at < NOW() - INTERVAL '15 minutes') \
             RETURNING sp.period_index, s.amount, s.user_id",
        )
        .bind(sub_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((period_index, amount, user_id)) = claimed else {
            return Ok(false);
        };

        let wallet = self.wallet.get_wallet(user_id).await?;
        let split = match allocate(wallet.available(), amount) {
            Ok(split) => split,
            Err(e) => {
                self.release_charge_claim(sub_id, period_index).await?;
                return Err(e.into());
            }
        };

        if split.charge_amount == 0 {
            // Fully covered by the wallet: the period settles immediately.
            let record = match self
                .wallet
                .subscription_balance(user_id, sub_id, period_index, amount)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    self.release_charge_claim(sub_id, period_index).await?;
                    return Err(e.into());
                }
            };
            sqlx::query(
                "UPDATE subscription_periods SET tx_id = $3, state = 'success', updated_at = NOW() \
                 WHERE subscription_id = $1 AND period_index = $2",
            )
            .bind(sub_id)
            .bind(period_index)
            .bind(record.id)
            .execute(&self.pool)
            .await?;
            tracing::info!(
                subscription_id = %sub_id,
                period_index = period_index,
                amount = amount,
                "period charged from balance"
            );
            return Ok(true);
        }

        let record = match self
            .wallet
            .subscription_pending(
                user_id,
                sub_id,
                period_index,
                split.balance_amount,
                split.charge_amount,
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.release_charge_claim(sub_id, period_index).await?;
                return Err(e.into());
            }
        };

        let payment_id = Uuid::new_v4();
        let (payment, _) = self
            .payments
            .create_payment(NewPayment {
                id: payment_id,
                user_id,
                amount: split.charge_amount,
                operation: Operation::Subscription {
                    subscription_id: sub_id,
                    period_index,
                    balance_amount: split.balance_amount,
                    charge_amount: split.charge_amount,
                },
                tx_id: Some(record.id),
                retry_key: None,
            })
            .await?;

        sqlx::query(
            "UPDATE subscription_periods SET tx_id = $3, payment_id = $4, updated_at = NOW() \
             WHERE subscription_id = $1 AND period_index = $2",
        )
        .bind(sub_id)
        .bind(period_index)
        .bind(record.id)
        .bind(payment.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %sub_id,
            period_index = period_index,
            balance_amount = split.balance_amount,
            charge_amount = split.charge_amount,
            payment_id = %payment.id,
            "period charge split between balance and gateway"
        );
        Ok(true)
    }

    async fn release_charge_claim(&self, sub_id: Uuid, period_index: i32) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscription_periods SET charge_claimed_at = NULL \
             WHERE subscription_id = $1 AND period_index = $2",
        )
        .bind(sub_id)
        .bind(period_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Cooperative cancellation
    // =========================================================================

    /// Periods whose in-flight payment should be canceled.
    pub async fn periods_awaiting_cancel(
        &self,
        limit: i64,
    ) -> BillingResult<Vec<PendingCancellation>> {
        let rows: Vec<PendingCancellation> = sqlx::query_as(
            "SELECT subscription_id, period_index, payment_id FROM subscription_periods \
             WHERE need_cancel AND NOT scheduled_cancel \
               AND state NOT IN ('success', 'canceled') \
             ORDER BY updated_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Claim a flagged period for cancellation, at most once.
    pub async fn claim_cancellation(&self, sub_id: Uuid, period_index: i32) -> BillingResult<bool> {
        let updated = sqlx::query(
            "UPDATE subscription_periods \
             SET scheduled_cancel = TRUE, state = 'canceling', updated_at = NOW() \
             WHERE subscription_id = $1 AND period_index = $2 \
               AND need_cancel AND NOT scheduled_cancel \
               AND state NOT IN ('success', 'canceled')",
        )
        .bind(sub_id)
        .bind(period_index)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

async fn lock_subscription(
    tx: &mut Transaction<'_, Postgres>,
    sub_id: Uuid,
) -> BillingResult<Subscription> {
    let row: Option<Subscription> = sqlx::query_as(
        "SELECT id, user_id, amount, interval, start_at, product, state, \
                current_period_index, created_at, updated_at \
         FROM subscriptions WHERE id = $1 FOR UPDATE",
    )
    .bind(sub_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| BillingError::NotFound(format!("subscription {sub_id}")))
}

async fn lock_period(
    tx: &mut Transaction<'_, Postgres>,
    sub_id: Uuid,
    period_index: i32,
) -> BillingResult<SubscriptionPeriod> {
    let row: Option<SubscriptionPeriod> = sqlx::query_as(
        "SELECT subscription_id, period_index, start_at, state, payment_id, tx_id, \
                need_cancel, scheduled_cancel, created_at, updated_at \
         FROM subscription_periods \
         WHERE subscription_id = $1 AND period_index = $2 FOR UPDATE",
    )
    .bind(sub_id)
    .bind(period_index)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| {
        BillingError::NotFound(format!("period {period_index} of subscription {sub_id}"))
    })
}

async fn set_subscription_state(
    tx: &mut Transaction<'_, Postgres>,
    sub_id: Uuid,
    state: SubscriptionState,
) -> BillingResult<()> {
    sqlx::query("UPDATE subscriptions SET state = $2, updated_at = NOW() WHERE id = $1")
        .bind(sub_id)
        .bind(state.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}
