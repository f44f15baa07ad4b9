//! The wallet ledger
//!
//! Balance mutations and the transaction log. Every operation follows one
//! shape: validate amounts, then inside one database transaction re-read
//! state under a row lock, check preconditions, write, commit. Only
//! after the commit are the per-user update events emitted.
//!
//! Two-phase operations (`*_pending` + outcome handlers) debit the payer's
//! wallet portion when the transaction is created and keep it `pending` until
//! the gateway outcome arrives: `commit` applies the remaining credits,
//! `cancel` refunds what was debited, `failing`/`action_needed` touch no
//! ledger state and only emit a payment-status notification.

use std::sync::Arc;

use parley_shared::{
    ensure_amount, ensure_split, Cents, Operation, OperationKind, UpdateNotifier, UserUpdate,
};
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{WalletError, WalletResult};
use crate::transactions::{TransactionStatus, WalletTransaction};

/// One user's wallet row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Wallet {
    pub user_id: Uuid,
    pub balance: Cents,
    pub balance_locked: Cents,
    pub is_locked: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Wallet {
    /// Amount eligible for new debits.
    pub fn available(&self) -> Cents {
        self.balance - self.balance_locked
    }
}

/// Ledger service over the shared pool.
#[derive(Clone)]
pub struct WalletService {
    pool: PgPool,
    notifier: Arc<dyn UpdateNotifier>,
}

impl WalletService {
    pub fn new(pool: PgPool, notifier: Arc<dyn UpdateNotifier>) -> Self {
        Self { pool, notifier }
    }

    fn emit(&self, user_id: Uuid, update: UserUpdate) {
        self.notifier.notify(user_id, update);
    }

    /// Fetch a wallet, creating it lazily on first access.
    pub async fn get_wallet(&self, user_id: Uuid) -> WalletResult<Wallet> {
        sqlx::query("INSERT INTO wallets (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let wallet: Wallet = sqlx::query_as(
            "SELECT user_id, balance, balance_locked, is_locked, created_at, updated_at \
             FROM wallets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(wallet)
    }

    /// Set the user-visible lock flag, derived from failing payments.
    pub async fn set_locked(&self, user_id: Uuid, locked: bool) -> WalletResult<()> {
        let mut conn = self.pool.acquire().await?;
        ensure_wallet(&mut conn, user_id).await?;
        drop(conn);
        let updated = sqlx::query(
            "UPDATE wallets SET is_locked = $2, updated_at = NOW() \
             WHERE user_id = $1 AND is_locked <> $2",
        )
        .bind(user_id)
        .bind(locked)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            tracing::info!(user_id = %user_id, locked = locked, "wallet lock state changed");
        }
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
    ) -> WalletResult<WalletTransaction> {
        let record: Option<WalletTransaction> = sqlx::query_as(
            "SELECT id, user_id, status, operation, created_at, updated_at \
             FROM wallet_transactions WHERE id = $1 AND user_id = $2",
        )
        .bind(tx_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WalletError::NotFound(format!("transaction {tx_id}")))
    }

    // =========================================================================
    // Deposits
    // =========================================================================

    /// Credit the wallet immediately and record a `success` transaction.
    pub async fn deposit_instant(
        &self,
        user_id: Uuid,
        amount: Cents,
    ) -> WalletResult<WalletTransaction> {
        ensure_amount(amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let (balance, locked) = credit(&mut tx, user_id, amount).await?;
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Success,
            &Operation::Deposit {
                amount,
                payment_id: None,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id: record.id });
        self.emit(
            user_id,
            UserUpdate::BalanceChanged {
                balance,
                available: balance - locked,
            },
        );
        tracing::info!(user_id = %user_id, amount = amount, tx_id = %record.id, "instant deposit");
        Ok(record)
    }

    /// Record a `pending` deposit to be settled by a gateway charge.
    pub async fn deposit_pending(
        &self,
        user_id: Uuid,
        amount: Cents,
        payment_id: Uuid,
    ) -> WalletResult<WalletTransaction> {
        ensure_amount(amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Pending,
            &Operation::Deposit {
                amount,
                payment_id: Some(payment_id),
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionPending { tx_id: record.id });
        Ok(record)
    }

    pub async fn deposit_commit(&self, user_id: Uuid, tx_id: Uuid) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;
        let record = load_tx_locked(&mut tx, tx_id).await?;
        ensure_owner(&record, user_id)?;
        record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Success)?;
        let amount = match record.operation() {
            Operation::Deposit { amount, .. } => *amount,
            other => return Err(kind_mismatch(OperationKind::Deposit, other)),
        };

        ensure_wallet(&mut tx, user_id).await?;
        let (balance, locked) = credit(&mut tx, user_id, amount).await?;
        set_tx_status(&mut tx, tx_id, TransactionStatus::Success).await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id });
        self.emit(
            user_id,
            UserUpdate::BalanceChanged {
                balance,
                available: balance - locked,
            },
        );
        tracing::info!(user_id = %user_id, tx_id = %tx_id, amount = amount, "deposit committed");
        Ok(())
    }

    pub async fn deposit_cancel(&self, user_id: Uuid, tx_id: Uuid) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;
        let record = load_tx_locked(&mut tx, tx_id).await?;
        ensure_owner(&record, user_id)?;
        record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Canceled)?;
        if record.operation().kind() != OperationKind::Deposit {
            return Err(kind_mismatch(OperationKind::Deposit, record.operation()));
        }

        set_tx_status(&mut tx, tx_id, TransactionStatus::Canceled).await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionCanceled { tx_id });
        tracing::info!(user_id = %user_id, tx_id = %tx_id, "deposit canceled");
        Ok(())
    }

    pub async fn deposit_failing(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(user_id, tx_id, OperationKind::Deposit, payment_id, "failing")
            .await
    }

    pub async fn deposit_action_needed(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(
            user_id,
            tx_id,
            OperationKind::Deposit,
            payment_id,
            "action_required",
        )
        .await
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Balance-only transfer: both legs settle immediately.
    pub async fn transfer_balance(
        &self,
        from: Uuid,
        to: Uuid,
        amount: Cents,
    ) -> WalletResult<(WalletTransaction, WalletTransaction)> {
        ensure_amount(amount)?;
        if from == to {
            return Err(WalletError::SelfTransfer);
        }

        let out_id = Uuid::new_v4();
        let in_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, from).await?;
        ensure_wallet(&mut tx, to).await?;
        let (sender_balance, sender_locked) = debit(&mut tx, from, amount).await?;
        let (receiver_balance, receiver_locked) = credit(&mut tx, to, amount).await?;
        let out_record = insert_tx_with_id(
            &mut tx,
            out_id,
            from,
            TransactionStatus::Success,
            &Operation::TransferOut {
                to,
                twin: in_id,
                balance_amount: amount,
                charge_amount: 0,
                payment_id: None,
            },
        )
        .await?;
        let in_record = insert_tx_with_id(
            &mut tx,
            in_id,
            to,
            TransactionStatus::Success,
            &Operation::TransferIn {
                from,
                twin: out_id,
                balance_amount: amount,
                charge_amount: 0,
                payment_id: None,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(from, UserUpdate::TransactionSucceeded { tx_id: out_id });
        self.emit(
            from,
            UserUpdate::BalanceChanged {
                balance: sender_balance,
                available: sender_balance - sender_locked,
            },
        );
        self.emit(to, UserUpdate::TransactionSucceeded { tx_id: in_id });
        self.emit(
            to,
            UserUpdate::BalanceChanged {
                balance: receiver_balance,
                available: receiver_balance - receiver_locked,
            },
        );
        tracing::info!(from = %from, to = %to, amount = amount, "balance transfer");
        Ok((out_record, in_record))
    }

    /// Two-phase transfer: the sender's wallet portion is debited now, both
    /// legs stay `pending` until the gateway outcome arrives.
    pub async fn transfer_pending(
        &self,
        from: Uuid,
        to: Uuid,
        balance_amount: Cents,
        charge_amount: Cents,
        payment_id: Uuid,
    ) -> WalletResult<(WalletTransaction, WalletTransaction)> {
        ensure_split(balance_amount, charge_amount)?;
        if from == to {
            return Err(WalletError::SelfTransfer);
        }

        let out_id = Uuid::new_v4();
        let in_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, from).await?;
        ensure_wallet(&mut tx, to).await?;
        let debited = if balance_amount > 0 {
            Some(debit(&mut tx, from, balance_amount).await?)
        } else {
            None
        };
        let out_record = insert_tx_with_id(
            &mut tx,
            out_id,
            from,
            TransactionStatus::Pending,
            &Operation::TransferOut {
                to,
                twin: in_id,
                balance_amount,
                charge_amount,
                payment_id: Some(payment_id),
            },
        )
        .await?;
        let in_record = insert_tx_with_id(
            &mut tx,
            in_id,
            to,
            TransactionStatus::Pending,
            &Operation::TransferIn {
                from,
                twin: out_id,
                balance_amount,
                charge_amount,
                payment_id: Some(payment_id),
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(from, UserUpdate::TransactionPending { tx_id: out_id });
        if let Some((balance, locked)) = debited {
            self.emit(
                from,
                UserUpdate::BalanceChanged {
                    balance,
                    available: balance - locked,
                },
            );
        }
        self.emit(to, UserUpdate::TransactionPending { tx_id: in_id });
        Ok((out_record, in_record))
    }

    /// Settle both legs: credit the receiver with the full transferred amount.
    pub async fn transfer_commit(&self, user_id: Uuid, out_tx_id: Uuid) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;
        let out_record = load_tx_locked(&mut tx, out_tx_id).await?;
        ensure_owner(&out_record, user_id)?;
        out_record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Success)?;
        let (to, twin, balance_amount, charge_amount) = match out_record.operation() {
            Operation::TransferOut {
                to,
                twin,
                balance_amount,
                charge_amount,
                ..
            } => (*to, *twin, *balance_amount, *charge_amount),
            other => return Err(kind_mismatch(OperationKind::TransferOut, other)),
        };

        let in_record = load_tx_locked(&mut tx, twin).await?;
        in_record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Success)?;

        ensure_wallet(&mut tx, to).await?;
        let (balance, locked) = credit(&mut tx, to, balance_amount + charge_amount).await?;
        set_tx_status(&mut tx, out_tx_id, TransactionStatus::Success).await?;
        set_tx_status(&mut tx, twin, TransactionStatus::Success).await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id: out_tx_id });
        self.emit(to, UserUpdate::TransactionSucceeded { tx_id: twin });
        self.emit(
            to,
            UserUpdate::BalanceChanged {
                balance,
                available: balance - locked,
            },
        );
        tracing::info!(
            from = %user_id,
            to = %to,
            amount = balance_amount + charge_amount,
            "transfer committed"
        );
        Ok(())
    }

    /// Cancel both legs and refund the sender's debited wallet portion.
    pub async fn transfer_cancel(&self, user_id: Uuid, out_tx_id: Uuid) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;
        let out_record = load_tx_locked(&mut tx, out_tx_id).await?;
        ensure_owner(&out_record, user_id)?;
        out_record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Canceled)?;
        let (to, twin, balance_amount) = match out_record.operation() {
            Operation::TransferOut {
                to,
                twin,
                balance_amount,
                ..
            } => (*to, *twin, *balance_amount),
            other => return Err(kind_mismatch(OperationKind::TransferOut, other)),
        };

        let in_record = load_tx_locked(&mut tx, twin).await?;
        in_record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Canceled)?;

        let refunded = if balance_amount > 0 {
            Some(credit(&mut tx, user_id, balance_amount).await?)
        } else {
            None
        };
        set_tx_status(&mut tx, out_tx_id, TransactionStatus::Canceled).await?;
        set_tx_status(&mut tx, twin, TransactionStatus::Canceled).await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionCanceled { tx_id: out_tx_id });
        if let Some((balance, locked)) = refunded {
            self.emit(
                user_id,
                UserUpdate::BalanceChanged {
                    balance,
                    available: balance - locked,
                },
            );
        }
        self.emit(to, UserUpdate::TransactionCanceled { tx_id: twin });
        tracing::info!(from = %user_id, to = %to, tx_id = %out_tx_id, "transfer canceled");
        Ok(())
    }

    pub async fn transfer_failing(
        &self,
        user_id: Uuid,
        out_tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(
            user_id,
            out_tx_id,
            OperationKind::TransferOut,
            payment_id,
            "failing",
        )
        .await
    }

    pub async fn transfer_action_needed(
        &self,
        user_id: Uuid,
        out_tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(
            user_id,
            out_tx_id,
            OperationKind::TransferOut,
            payment_id,
            "action_required",
        )
        .await
    }

    // =========================================================================
    // Subscription charges
    // =========================================================================

    /// Fully wallet-covered period charge: debit and settle immediately.
    pub async fn subscription_balance(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        period_index: i32,
        amount: Cents,
    ) -> WalletResult<WalletTransaction> {
        ensure_amount(amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let (balance, locked) = debit(&mut tx, user_id, amount).await?;
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Success,
            &Operation::Subscription {
                subscription_id,
                period_index,
                balance_amount: amount,
                charge_amount: 0,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id: record.id });
        self.emit(
            user_id,
            UserUpdate::BalanceChanged {
                balance,
                available: balance - locked,
            },
        );
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            period_index = period_index,
            amount = amount,
            "subscription charged from balance"
        );
        Ok(record)
    }

    /// Split period charge: wallet portion debited now, settled on outcome.
    pub async fn subscription_pending(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        period_index: i32,
        balance_amount: Cents,
        charge_amount: Cents,
    ) -> WalletResult<WalletTransaction> {
        ensure_split(balance_amount, charge_amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let debited = if balance_amount > 0 {
            Some(debit(&mut tx, user_id, balance_amount).await?)
        } else {
            None
        };
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Pending,
            &Operation::Subscription {
                subscription_id,
                period_index,
                balance_amount,
                charge_amount,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionPending { tx_id: record.id });
        if let Some((balance, locked)) = debited {
            self.emit(
                user_id,
                UserUpdate::BalanceChanged {
                    balance,
                    available: balance - locked,
                },
            );
        }
        Ok(record)
    }

    pub async fn subscription_commit(&self, user_id: Uuid, tx_id: Uuid) -> WalletResult<()> {
        self.finalize_charge(user_id, tx_id, OperationKind::Subscription).await
    }

    pub async fn subscription_cancel(&self, user_id: Uuid, tx_id: Uuid) -> WalletResult<()> {
        self.cancel_charge(user_id, tx_id, OperationKind::Subscription).await
    }

    pub async fn subscription_failing(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(
            user_id,
            tx_id,
            OperationKind::Subscription,
            payment_id,
            "failing",
        )
        .await
    }

    pub async fn subscription_action_needed(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(
            user_id,
            tx_id,
            OperationKind::Subscription,
            payment_id,
            "action_required",
        )
        .await
    }

    // =========================================================================
    // Purchases
    // =========================================================================

    pub async fn purchase_instant(
        &self,
        user_id: Uuid,
        product: &str,
        amount: Cents,
    ) -> WalletResult<WalletTransaction> {
        ensure_amount(amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let (balance, locked) = debit(&mut tx, user_id, amount).await?;
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Success,
            &Operation::Purchase {
                product: product.to_string(),
                balance_amount: amount,
                charge_amount: 0,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id: record.id });
        self.emit(
            user_id,
            UserUpdate::BalanceChanged {
                balance,
                available: balance - locked,
            },
        );
        tracing::info!(user_id = %user_id, product = product, amount = amount, "instant purchase");
        Ok(record)
    }

    pub async fn purchase_pending(
        &self,
        user_id: Uuid,
        product: &str,
        balance_amount: Cents,
        charge_amount: Cents,
    ) -> WalletResult<WalletTransaction> {
        ensure_split(balance_amount, charge_amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let debited = if balance_amount > 0 {
            Some(debit(&mut tx, user_id, balance_amount).await?)
        } else {
            None
        };
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Pending,
            &Operation::Purchase {
                product: product.to_string(),
                balance_amount,
                charge_amount,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionPending { tx_id: record.id });
        if let Some((balance, locked)) = debited {
            self.emit(
                user_id,
                UserUpdate::BalanceChanged {
                    balance,
                    available: balance - locked,
                },
            );
        }
        Ok(record)
    }

    pub async fn purchase_commit(&self, user_id: Uuid, tx_id: Uuid) -> WalletResult<()> {
        self.finalize_charge(user_id, tx_id, OperationKind::Purchase).await
    }

    pub async fn purchase_cancel(&self, user_id: Uuid, tx_id: Uuid) -> WalletResult<()> {
        self.cancel_charge(user_id, tx_id, OperationKind::Purchase).await
    }

    pub async fn purchase_failing(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(user_id, tx_id, OperationKind::Purchase, payment_id, "failing")
            .await
    }

    pub async fn purchase_action_needed(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        payment_id: Uuid,
    ) -> WalletResult<()> {
        self.signal_payment_status(
            user_id,
            tx_id,
            OperationKind::Purchase,
            payment_id,
            "action_required",
        )
        .await
    }

    // =========================================================================
    // Income
    // =========================================================================

    /// Credit income derived from a related parent transaction.
    pub async fn credit_income(
        &self,
        user_id: Uuid,
        source_tx: Uuid,
        amount: Cents,
    ) -> WalletResult<WalletTransaction> {
        ensure_amount(amount)?;

        let mut tx = self.pool.begin().await?;
        ensure_wallet(&mut tx, user_id).await?;
        let (balance, locked) = credit(&mut tx, user_id, amount).await?;
        let record = insert_tx(
            &mut tx,
            user_id,
            TransactionStatus::Success,
            &Operation::Income {
                source: source_tx,
                amount,
            },
        )
        .await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id: record.id });
        self.emit(
            user_id,
            UserUpdate::BalanceChanged {
                balance,
                available: balance - locked,
            },
        );
        Ok(record)
    }

    // =========================================================================
    // Shared charge plumbing
    // =========================================================================

    /// Move a pending charge transaction to `success`. The wallet portion was
    /// debited at creation, so no balance change happens here.
    async fn finalize_charge(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        expected: OperationKind,
    ) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;
        let record = load_tx_locked(&mut tx, tx_id).await?;
        ensure_owner(&record, user_id)?;
        record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Success)?;
        if record.operation().kind() != expected {
            return Err(kind_mismatch(expected, record.operation()));
        }

        set_tx_status(&mut tx, tx_id, TransactionStatus::Success).await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionSucceeded { tx_id });
        tracing::info!(user_id = %user_id, tx_id = %tx_id, kind = %expected, "charge committed");
        Ok(())
    }

    /// Cancel a pending charge transaction, refunding the debited wallet
    /// portion.
    async fn cancel_charge(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        expected: OperationKind,
    ) -> WalletResult<()> {
        let mut tx = self.pool.begin().await?;
        let record = load_tx_locked(&mut tx, tx_id).await?;
        ensure_owner(&record, user_id)?;
        record
            .status()?
            .ensure_can_transition_to(TransactionStatus::Canceled)?;
        if record.operation().kind() != expected {
            return Err(kind_mismatch(expected, record.operation()));
        }

        let balance_amount = record.operation().balance_amount();
        let refunded = if balance_amount > 0 {
            Some(credit(&mut tx, user_id, balance_amount).await?)
        } else {
            None
        };
        set_tx_status(&mut tx, tx_id, TransactionStatus::Canceled).await?;
        tx.commit().await?;

        self.emit(user_id, UserUpdate::TransactionCanceled { tx_id });
        if let Some((balance, locked)) = refunded {
            self.emit(
                user_id,
                UserUpdate::BalanceChanged {
                    balance,
                    available: balance - locked,
                },
            );
        }
        tracing::info!(user_id = %user_id, tx_id = %tx_id, kind = %expected, "charge canceled");
        Ok(())
    }

    /// `failing` / `action_needed`: no ledger state change. Verifies the
    /// transaction is live and emits a payment-status notification; repeat
    /// calls while the transaction is pending are no-ops beyond the signal.
    async fn signal_payment_status(
        &self,
        user_id: Uuid,
        tx_id: Uuid,
        expected: OperationKind,
        payment_id: Uuid,
        state: &str,
    ) -> WalletResult<()> {
        let record = self.get_transaction(user_id, tx_id).await?;
        if record.operation().kind() != expected {
            return Err(kind_mismatch(expected, record.operation()));
        }
        if record.status()?.is_terminal() {
            return Err(WalletError::InvalidState(format!(
                "transaction {tx_id} is already {}",
                record.status
            )));
        }

        self.emit(
            user_id,
            UserUpdate::PaymentStatusChanged {
                payment_id,
                state: state.to_string(),
            },
        );
        Ok(())
    }
}

// =============================================================================
// Row-level helpers
// =============================================================================

async fn ensure_wallet(conn: &mut PgConnection, user_id: Uuid) -> WalletResult<()> {
    sqlx::query("INSERT INTO wallets (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Debit `amount` if the available balance covers it. The `WHERE` clause is
/// the invariant: `balance - balance_locked >= amount` or no row changes.
async fn debit(conn: &mut PgConnection, user_id: Uuid, amount: Cents) -> WalletResult<(Cents, Cents)> {
    let row: Option<(Cents, Cents)> = sqlx::query_as(
        "UPDATE wallets SET balance = balance - $2, updated_at = NOW() \
         WHERE user_id = $1 AND balance - balance_locked >= $2 \
         RETURNING balance, balance_locked",
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(conn)
    .await?;

    row.ok_or(WalletError::InsufficientFunds)
}

async fn credit(conn: &mut PgConnection, user_id: Uuid, amount: Cents) -> WalletResult<(Cents, Cents)> {
    let row: Option<(Cents, Cents)> = sqlx::query_as(
        "UPDATE wallets SET balance = balance + $2, updated_at = NOW() \
         WHERE user_id = $1 \
         RETURNING balance, balance_locked",
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(conn)
    .await?;

    row.ok_or_else(|| WalletError::Internal(format!("wallet {user_id} missing during credit")))
}

async fn insert_tx(
    conn: &mut PgConnection,
    user_id: Uuid,
    status: TransactionStatus,
    operation: &Operation,
) -> WalletResult<WalletTransaction> {
    insert_tx_with_id(conn, Uuid::new_v4(), user_id, status, operation).await
}

async fn insert_tx_with_id(
    conn: &mut PgConnection,
    id: Uuid,
    user_id: Uuid,
    status: TransactionStatus,
    operation: &Operation,
) -> WalletResult<WalletTransaction> {
    let record: WalletTransaction = sqlx::query_as(
        "INSERT INTO wallet_transactions (id, user_id, status, operation) \
         VALUES ($1, $2, $3, $4) \
         RETURNING id, user_id, status, operation, created_at, updated_at",
    )
    .bind(id)
    .bind(user_id)
    .bind(status.as_str())
    .bind(Json(operation))
    .fetch_one(conn)
    .await?;
    Ok(record)
}

async fn load_tx_locked(conn: &mut PgConnection, tx_id: Uuid) -> WalletResult<WalletTransaction> {
    let record: Option<WalletTransaction> = sqlx::query_as(
        "SELECT id, user_id, status, operation, created_at, updated_at \
         FROM wallet_transactions WHERE id = $1 FOR UPDATE",
    )
    .bind(tx_id)
    .fetch_optional(conn)
    .await?;

    record.ok_or_else(|| WalletError::NotFound(format!("transaction {tx_id}")))
}

async fn set_tx_status(
    conn: &mut PgConnection,
    tx_id: Uuid,
    status: TransactionStatus,
) -> WalletResult<()> {
    sqlx::query("UPDATE wallet_transactions SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(tx_id)
        .bind(status.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

fn ensure_owner(record: &WalletTransaction, user_id: Uuid) -> WalletResult<()> {
    if record.user_id != user_id {
        return Err(WalletError::InvalidState(format!(
            "transaction {} belongs to a different user",
            record.id
        )));
    }
    Ok(())
}

fn kind_mismatch(expected: OperationKind, got: &Operation) -> WalletError {
    WalletError::InvalidState(format!(
        "expected a {expected} transaction, found {}",
        got.kind()
    ))
}
