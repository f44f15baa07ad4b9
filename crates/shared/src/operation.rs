//! The tagged operation union
//!
//! Every wallet transaction and every off-session payment carries an
//! [`Operation`] describing what kind of movement it represents. The enum is
//! closed and exhaustively matched wherever it is consumed (the ledger, the
//! outcome router, the invariant checks), so adding a kind is a compile-time
//! checked change.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Cents;

/// What a transaction or payment moves.
///
/// Stored as JSONB; the `kind` tag doubles as the routing key for gateway
/// outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Top-up of the user's own wallet.
    Deposit {
        amount: Cents,
        payment_id: Option<Uuid>,
    },
    /// Sender leg of a transfer. `twin` is the receiver-side transaction.
    TransferOut {
        to: Uuid,
        twin: Uuid,
        balance_amount: Cents,
        charge_amount: Cents,
        payment_id: Option<Uuid>,
    },
    /// Receiver leg of a transfer. `twin` is the sender-side transaction.
    TransferIn {
        from: Uuid,
        twin: Uuid,
        balance_amount: Cents,
        charge_amount: Cents,
        payment_id: Option<Uuid>,
    },
    /// One billing period of a subscription.
    Subscription {
        subscription_id: Uuid,
        period_index: i32,
        balance_amount: Cents,
        charge_amount: Cents,
    },
    /// One-off product purchase.
    Purchase {
        product: String,
        balance_amount: Cents,
        charge_amount: Cents,
    },
    /// Credit derived from a related parent transaction.
    Income { source: Uuid, amount: Cents },
}

/// Discriminant-only view of [`Operation`], for precondition checks and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Deposit,
    TransferOut,
    TransferIn,
    Subscription,
    Purchase,
    Income,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Deposit { .. } => OperationKind::Deposit,
            Operation::TransferOut { .. } => OperationKind::TransferOut,
            Operation::TransferIn { .. } => OperationKind::TransferIn,
            Operation::Subscription { .. } => OperationKind::Subscription,
            Operation::Purchase { .. } => OperationKind::Purchase,
            Operation::Income { .. } => OperationKind::Income,
        }
    }

    /// Wallet-covered portion of this operation, if any.
    pub fn balance_amount(&self) -> Cents {
        match self {
            Operation::Deposit { .. } => 0,
            Operation::TransferOut { balance_amount, .. }
            | Operation::TransferIn { balance_amount, .. }
            | Operation::Subscription { balance_amount, .. }
            | Operation::Purchase { balance_amount, .. } => *balance_amount,
            Operation::Income { .. } => 0,
        }
    }
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::TransferOut => "transfer_out",
            OperationKind::TransferIn => "transfer_in",
            OperationKind::Subscription => "subscription",
            OperationKind::Purchase => "purchase",
            OperationKind::Income => "income",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tag_round_trip() {
        let op = Operation::Subscription {
            subscription_id: Uuid::new_v4(),
            period_index: 3,
            balance_amount: 40,
            charge_amount: 160,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "subscription");
        assert_eq!(json["period_index"], 3);
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn kind_matches_variant() {
        let op = Operation::Deposit {
            amount: 500,
            payment_id: None,
        };
        assert_eq!(op.kind(), OperationKind::Deposit);
        assert_eq!(op.kind().as_str(), "deposit");
        assert_eq!(op.balance_amount(), 0);
    }
}
