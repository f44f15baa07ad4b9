//! Payment and payment-intent registry
//!
//! A `Payment` is one logical off-session charge request; it is created once
//! (idempotent by retry key when the caller supplies one) and survives any
//! number of gateway intents created, retried and recreated underneath it.
//! Intents progress one way, `pending -> success|canceled`, and the boolean
//! returned by the terminal transitions is what keeps the reconciliation
//! paths from double-applying an outcome.

use std::sync::Arc;

use parley_shared::{ensure_amount, Cents, Operation, UpdateNotifier, UserUpdate};
use parley_wallet::WalletService;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Lifecycle of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Failing,
    ActionRequired,
    Success,
    Canceled,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Failing => "failing",
            PaymentState::ActionRequired => "action_required",
            PaymentState::Success => "success",
            PaymentState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(PaymentState::Pending),
            "failing" => Ok(PaymentState::Failing),
            "action_required" => Ok(PaymentState::ActionRequired),
            "success" => Ok(PaymentState::Success),
            "canceled" => Ok(PaymentState::Canceled),
            other => Err(BillingError::Internal(format!(
                "unknown payment state '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Success | PaymentState::Canceled)
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One off-session charge request.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Cents,
    pub state: String,
    pub operation: Json<Operation>,
    pub retry_key: Option<String>,
    pub intent_id: Option<String>,
    pub tx_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn state(&self) -> BillingResult<PaymentState> {
        PaymentState::parse(&self.state)
    }

    pub fn operation(&self) -> &Operation {
        &self.operation.0
    }
}

/// Gateway-facing intent record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentIntentRecord {
    pub id: String,
    pub amount: Cents,
    pub state: String,
    pub operation: Json<Operation>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Parameters for creating a payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Cents,
    pub operation: Operation,
    pub tx_id: Option<Uuid>,
    pub retry_key: Option<String>,
}

#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
    wallet: WalletService,
    notifier: Arc<dyn UpdateNotifier>,
}

impl PaymentService {
    pub fn new(pool: PgPool, wallet: WalletService, notifier: Arc<dyn UpdateNotifier>) -> Self {
        Self {
            pool,
            wallet,
            notifier,
        }
    }

    /// Create a payment plus its scheduling row. With a retry key, a repeat
    /// call returns the already-created payment and reports `false`.
    pub async fn create_payment(&self, new: NewPayment) -> BillingResult<(Payment, bool)> {
        ensure_amount(new.amount)?;

        let mut tx = self.pool.begin().await?;
        let inserted: Option<Payment> = sqlx::query_as(
            "INSERT INTO payments (id, user_id, amount, state, operation, retry_key, tx_id) \
             VALUES ($1, $2, $3, 'pending', $4, $5, $6) \
             ON CONFLICT (retry_key) DO NOTHING \
             RETURNING id, user_id, amount, state, operation, retry_key, intent_id, tx_id, \
                       created_at, updated_at",
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(new.amount)
        .bind(Json(&new.operation))
        .bind(&new.retry_key)
        .bind(new.tx_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payment) = inserted else {
            // Retry-key conflict: the payment already exists.
            drop(tx);
            let key = new.retry_key.as_deref().unwrap_or_default();
            let existing = self.find_by_retry_key(key).await?.ok_or_else(|| {
                BillingError::Internal(format!("payment with retry key '{key}' vanished"))
            })?;
            return Ok((existing, false));
        };

        sqlx::query("INSERT INTO payment_scheduling (payment_id) VALUES ($1)")
            .bind(payment.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notifier.notify(
            payment.user_id,
            UserUpdate::PaymentStatusChanged {
                payment_id: payment.id,
                state: payment.state.clone(),
            },
        );
        tracing::info!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            amount = payment.amount,
            kind = %payment.operation().kind(),
            "payment created"
        );
        Ok((payment, true))
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Payment> {
        let row: Option<Payment> = sqlx::query_as(
            "SELECT id, user_id, amount, state, operation, retry_key, intent_id, tx_id, \
                    created_at, updated_at \
             FROM payments WHERE id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("payment {payment_id}")))
    }

    pub async fn find_by_retry_key(&self, retry_key: &str) -> BillingResult<Option<Payment>> {
        let row: Option<Payment> = sqlx::query_as(
            "SELECT id, user_id, amount, state, operation, retry_key, intent_id, tx_id, \
                    created_at, updated_at \
             FROM payments WHERE retry_key = $1",
        )
        .bind(retry_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_intent(&self, intent_id: &str) -> BillingResult<Option<Payment>> {
        let row: Option<Payment> = sqlx::query_as(
            "SELECT id, user_id, amount, state, operation, retry_key, intent_id, tx_id, \
                    created_at, updated_at \
             FROM payments WHERE intent_id = $1",
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Move a payment to a new state unless it is already terminal. Returns
    /// whether anything changed; emits the status update and re-derives the
    /// wallet lock flag when it did.
    pub async fn set_state(&self, payment_id: Uuid, state: PaymentState) -> BillingResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE payments SET state = $2, updated_at = NOW() \
             WHERE id = $1 AND state NOT IN ('success', 'canceled') AND state <> $2 \
             RETURNING user_id",
        )
        .bind(payment_id)
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((user_id,)) = row else {
            return Ok(false);
        };

        self.notifier.notify(
            user_id,
            UserUpdate::PaymentStatusChanged {
                payment_id,
                state: state.as_str().to_string(),
            },
        );
        self.sync_lock_state(user_id).await?;
        tracing::info!(payment_id = %payment_id, state = %state, "payment state changed");
        Ok(true)
    }

    /// Link the current gateway intent to its payment.
    pub async fn attach_intent(&self, payment_id: Uuid, intent_id: &str) -> BillingResult<()> {
        sqlx::query("UPDATE payments SET intent_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(payment_id)
            .bind(intent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register a gateway intent. Registering the same id twice is an error.
    pub async fn register_intent(
        &self,
        intent_id: &str,
        amount: Cents,
        operation: &Operation,
    ) -> BillingResult<()> {
        ensure_amount(amount)?;

        let inserted = sqlx::query(
            "INSERT INTO payment_intents (id, amount, state, operation) \
             VALUES ($1, $2, 'pending', $3) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(intent_id)
        .bind(amount)
        .bind(Json(operation))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(BillingError::AlreadyExists(format!(
                "payment intent {intent_id}"
            )));
        }
        Ok(())
    }

    pub async fn get_intent(&self, intent_id: &str) -> BillingResult<Option<PaymentIntentRecord>> {
        let row: Option<PaymentIntentRecord> = sqlx::query_as(
            "SELECT id, amount, state, operation, created_at, updated_at \
             FROM payment_intents WHERE id = $1",
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Terminal transition `pending -> success`. Returns `false` when the
    /// intent is unknown or no longer pending; callers use this to decide
    /// whether to continue routing the outcome.
    pub async fn intent_success(&self, intent_id: &str) -> BillingResult<bool> {
        self.intent_terminal(intent_id, "success").await
    }

    /// Terminal transition `pending -> canceled`. Same contract as
    /// [`intent_success`](Self::intent_success).
    pub async fn intent_cancel(&self, intent_id: &str) -> BillingResult<bool> {
        self.intent_terminal(intent_id, "canceled").await
    }

    async fn intent_terminal(&self, intent_id: &str, state: &str) -> BillingResult<bool> {
        let updated = sqlx::query(
            "UPDATE payment_intents SET state = $2, updated_at = NOW() \
             WHERE id = $1 AND state = 'pending'",
        )
        .bind(intent_id)
        .bind(state)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Number of payments currently failing for a user. Exposed to the API
    /// layer and used to derive the wallet lock flag.
    pub async fn count_failing(&self, user_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM payments WHERE user_id = $1 AND state = 'failing'")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Re-derive the user-visible wallet lock from failing payments.
    pub async fn sync_lock_state(&self, user_id: Uuid) -> BillingResult<()> {
        let failing = self.count_failing(user_id).await?;
        self.wallet.set_locked(user_id, failing > 0).await?;
        Ok(())
    }
}
