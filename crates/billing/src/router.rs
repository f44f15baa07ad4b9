//! Outcome router
//!
//! Single dispatch point between gateway outcomes and the state machines.
//! Holds no state and performs no I/O of its own: it matches on the
//! payment's operation kind and delegates to the ledger and, for
//! subscription charges, to the billing engine, in that order.
//!
//! The operation union is closed: kinds that no producer routes through here
//! (`purchase`, `income`, the receiving transfer leg) are a hard error.

use parley_shared::{Operation, PaymentOutcome};
use parley_wallet::WalletService;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payments::Payment;
use crate::subscriptions::SubscriptionService;

#[derive(Clone)]
pub struct OutcomeRouter {
    wallet: WalletService,
    subscriptions: SubscriptionService,
}

impl OutcomeRouter {
    pub fn new(wallet: WalletService, subscriptions: SubscriptionService) -> Self {
        Self {
            wallet,
            subscriptions,
        }
    }

    /// Route one outcome to the matching ledger and engine transitions.
    pub async fn route(&self, payment: &Payment, outcome: PaymentOutcome) -> BillingResult<()> {
        let user_id = payment.user_id;
        let payment_id = payment.id;

        tracing::info!(
            payment_id = %payment_id,
            user_id = %user_id,
            kind = %payment.operation().kind(),
            outcome = %outcome,
            "routing payment outcome"
        );

        match payment.operation() {
            Operation::Deposit { .. } => {
                let tx_id = ledger_tx(payment)?;
                match outcome {
                    PaymentOutcome::Success => self.wallet.deposit_commit(user_id, tx_id).await?,
                    PaymentOutcome::Canceled => self.wallet.deposit_cancel(user_id, tx_id).await?,
                    PaymentOutcome::Failing => {
                        self.wallet.deposit_failing(user_id, tx_id, payment_id).await?
                    }
                    PaymentOutcome::ActionNeeded => {
                        self.wallet
                            .deposit_action_needed(user_id, tx_id, payment_id)
                            .await?
                    }
                }
            }
            Operation::TransferOut { .. } => {
                let tx_id = ledger_tx(payment)?;
                match outcome {
                    PaymentOutcome::Success => self.wallet.transfer_commit(user_id, tx_id).await?,
                    PaymentOutcome::Canceled => self.wallet.transfer_cancel(user_id, tx_id).await?,
                    PaymentOutcome::Failing => {
                        self.wallet
                            .transfer_failing(user_id, tx_id, payment_id)
                            .await?
                    }
                    PaymentOutcome::ActionNeeded => {
                        self.wallet
                            .transfer_action_needed(user_id, tx_id, payment_id)
                            .await?
                    }
                }
            }
            Operation::Subscription {
                subscription_id,
                period_index,
                ..
            } => {
                let sub_id = *subscription_id;
                let period_index = *period_index;
                let tx_id = ledger_tx(payment)?;
                let now = OffsetDateTime::now_utc();

                // Ledger first, then the engine.
                match outcome {
                    PaymentOutcome::Success => {
                        self.wallet.subscription_commit(user_id, tx_id).await?;
                        self.subscriptions
                            .payment_succeeded(sub_id, period_index, now)
                            .await?;
                    }
                    PaymentOutcome::Canceled => {
                        self.wallet.subscription_cancel(user_id, tx_id).await?;
                        self.subscriptions
                            .payment_canceled(sub_id, period_index, now)
                            .await?;
                    }
                    PaymentOutcome::Failing => {
                        self.wallet
                            .subscription_failing(user_id, tx_id, payment_id)
                            .await?;
                        self.subscriptions
                            .payment_failing(sub_id, period_index, now)
                            .await?;
                    }
                    PaymentOutcome::ActionNeeded => {
                        self.wallet
                            .subscription_action_needed(user_id, tx_id, payment_id)
                            .await?;
                        self.subscriptions
                            .payment_action_needed(sub_id, period_index, now)
                            .await?;
                    }
                }
            }
            op @ (Operation::TransferIn { .. }
            | Operation::Purchase { .. }
            | Operation::Income { .. }) => {
                // Closed producer set: nothing creates payments with these
                // kinds, so reaching this arm is a bug upstream.
                return Err(BillingError::Internal(format!(
                    "unknown operation type '{}' for payment {payment_id}",
                    op.kind()
                )));
            }
        }

        Ok(())
    }
}

fn ledger_tx(payment: &Payment) -> BillingResult<Uuid> {
    payment.tx_id.ok_or_else(|| {
        BillingError::Internal(format!(
            "transaction reference missing on payment {}",
            payment.id
        ))
    })
}
