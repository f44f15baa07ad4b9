//! Customer and card management
//!
//! One billing-customer row per user, created by `enable_payments` with a
//! unique idempotency seed. The gateway customer id is applied
//! first-write-wins and never overwritten. Card rules: at most one default
//! per user; removing the default promotes an arbitrary remaining card;
//! repeated identical operations return `false` instead of erroring.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Billing-customer row for a user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BillingCustomer {
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub idempotency_seed: String,
    pub created_at: OffsetDateTime,
}

/// A registered card.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub method_id: String,
    pub is_default: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Enable payments for a user. Fails if already enabled.
    pub async fn enable_payments(&self, user_id: Uuid) -> BillingResult<()> {
        let seed = Uuid::new_v4().simple().to_string();
        let inserted = sqlx::query(
            "INSERT INTO billing_customers (user_id, idempotency_seed) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(&seed)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(BillingError::AlreadyExists(format!(
                "payments already enabled for user {user_id}"
            )));
        }

        tracing::info!(user_id = %user_id, "payments enabled");
        Ok(())
    }

    pub async fn get_customer(&self, user_id: Uuid) -> BillingResult<BillingCustomer> {
        let row: Option<BillingCustomer> = sqlx::query_as(
            "SELECT user_id, customer_id, idempotency_seed, created_at \
             FROM billing_customers WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("payments not enabled for user {user_id}")))
    }

    pub async fn get_customer_id(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.get_customer(user_id).await?.customer_id)
    }

    /// Record the gateway customer id, first-write-wins. Returns whether this
    /// call was the writer.
    pub async fn apply_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<bool> {
        let updated = sqlx::query(
            "UPDATE billing_customers SET customer_id = $2 \
             WHERE user_id = $1 AND customer_id IS NULL",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Gateway customer id for the user, creating the gateway customer on
    /// first use. The idempotency seed makes the creation safe to replay.
    pub async fn ensure_customer_id(&self, user_id: Uuid) -> BillingResult<String> {
        let customer = self.get_customer(user_id).await?;
        if let Some(id) = customer.customer_id {
            return Ok(id);
        }

        let created = self
            .stripe
            .create_customer(user_id, &customer.idempotency_seed)
            .await?;
        if !self.apply_customer_id(user_id, &created).await? {
            // Lost the race: another writer got there first.
            tracing::info!(user_id = %user_id, "customer id already applied by another writer");
        }

        self.get_customer_id(user_id)
            .await?
            .ok_or_else(|| BillingError::Internal("customer id missing after apply".to_string()))
    }

    /// Attach a card. The first card becomes the default. Returns `false` if
    /// the card is already registered.
    pub async fn add_payment_method(&self, user_id: Uuid, method_id: &str) -> BillingResult<bool> {
        let customer_id = self.ensure_customer_id(user_id).await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payment_methods WHERE user_id = $1 AND method_id = $2",
        )
        .bind(user_id)
        .bind(method_id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(false);
        }

        // Gateway first; the local row is only written once the card is
        // attached on the gateway side.
        self.stripe
            .attach_payment_method(&customer_id, method_id)
            .await?;

        let mut tx = self.pool.begin().await?;
        // The customer row is the per-user mutex for card bookkeeping.
        lock_customer(&mut tx, user_id).await?;

        let inserted = sqlx::query(
            "INSERT INTO payment_methods (id, user_id, method_id, is_default) \
             VALUES ($1, $2, $3, NOT EXISTS ( \
                 SELECT 1 FROM payment_methods WHERE user_id = $2 AND is_default \
             )) \
             ON CONFLICT (user_id, method_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(method_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if inserted == 0 {
            return Ok(false);
        }
        tracing::info!(user_id = %user_id, method_id = %method_id, "payment method added");
        Ok(true)
    }

    /// Detach a card. Removing the default promotes an arbitrary remaining
    /// card. Returns `false` if the card was not registered.
    pub async fn remove_payment_method(
        &self,
        user_id: Uuid,
        method_id: &str,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        lock_customer(&mut tx, user_id).await?;

        let removed: Option<(bool,)> = sqlx::query_as(
            "DELETE FROM payment_methods WHERE user_id = $1 AND method_id = $2 \
             RETURNING is_default",
        )
        .bind(user_id)
        .bind(method_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((was_default,)) = removed else {
            return Ok(false);
        };

        if was_default {
            sqlx::query(
                "UPDATE payment_methods SET is_default = TRUE \
                 WHERE id = ( \
                     SELECT id FROM payment_methods WHERE user_id = $1 \
                     ORDER BY created_at LIMIT 1 \
                 )",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        // Fire-and-forget on the gateway side: the local registry is
        // authoritative for which card gets charged.
        if let Err(e) = self.stripe.detach_payment_method(method_id).await {
            tracing::warn!(user_id = %user_id, method_id = %method_id, error = %e,
                "failed to detach payment method on gateway");
        }

        tracing::info!(user_id = %user_id, method_id = %method_id, "payment method removed");
        Ok(true)
    }

    /// Make a registered card the default. Returns `false` if it already is.
    pub async fn make_default(&self, user_id: Uuid, method_id: &str) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        lock_customer(&mut tx, user_id).await?;

        let current: Option<(bool,)> = sqlx::query_as(
            "SELECT is_default FROM payment_methods WHERE user_id = $1 AND method_id = $2",
        )
        .bind(user_id)
        .bind(method_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((is_default,)) = current else {
            return Err(BillingError::NotFound(format!(
                "payment method {method_id} for user {user_id}"
            )));
        };
        if is_default {
            return Ok(false);
        }

        sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE user_id = $1 AND is_default")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE payment_methods SET is_default = TRUE WHERE user_id = $1 AND method_id = $2",
        )
        .bind(user_id)
        .bind(method_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, method_id = %method_id, "default payment method changed");
        Ok(true)
    }

    pub async fn default_payment_method(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT method_id FROM payment_methods WHERE user_id = $1 AND is_default",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(m,)| m))
    }

    pub async fn list_payment_methods(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<StoredPaymentMethod>> {
        let rows: Vec<StoredPaymentMethod> = sqlx::query_as(
            "SELECT id, user_id, method_id, is_default, created_at \
             FROM payment_methods WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn lock_customer(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
) -> BillingResult<()> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM billing_customers WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
    row.map(|_| ())
        .ok_or_else(|| BillingError::NotFound(format!("payments not enabled for user {user_id}")))
}
