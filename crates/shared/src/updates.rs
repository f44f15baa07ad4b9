//! Per-user update events
//!
//! Every ledger mutation emits an ordered update for the owning user. The
//! live-update layer (an external collaborator) consumes these to push
//! balance and transaction changes to connected clients. Delivery is
//! fire-and-forget: a failing notifier must never fail the mutation that
//! produced the event.

use serde::Serialize;
use uuid::Uuid;

use crate::money::Cents;

/// A user-visible state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UserUpdate {
    TransactionPending { tx_id: Uuid },
    TransactionSucceeded { tx_id: Uuid },
    TransactionCanceled { tx_id: Uuid },
    BalanceChanged { balance: Cents, available: Cents },
    PaymentStatusChanged { payment_id: Uuid, state: String },
}

/// Sink for per-user updates, injected into the ledger and the payment
/// registry. Implementations must not block and must not panic.
pub trait UpdateNotifier: Send + Sync {
    fn notify(&self, user_id: Uuid, update: UserUpdate);
}

/// Default notifier: structured log lines only. Used by the worker, where no
/// live-update layer is attached.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl UpdateNotifier for LogNotifier {
    fn notify(&self, user_id: Uuid, update: UserUpdate) {
        tracing::debug!(user_id = %user_id, update = ?update, "user update");
    }
}
