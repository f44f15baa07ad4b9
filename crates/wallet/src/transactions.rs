//! Wallet transactions
//!
//! Append-mostly log entries. Identity and operation are immutable; only the
//! status moves, exactly once, from `pending` to a terminal state.

use parley_shared::Operation;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{WalletError, WalletResult};

/// Lifecycle of a wallet transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Success,
    Canceled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> WalletResult<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "success" => Ok(TransactionStatus::Success),
            "canceled" => Ok(TransactionStatus::Canceled),
            other => Err(WalletError::Internal(format!(
                "unknown transaction status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Canceled)
    }

    /// Guard for the one-way status machine. Terminal states never move.
    pub fn ensure_can_transition_to(&self, next: TransactionStatus) -> WalletResult<()> {
        if self.is_terminal() {
            return Err(WalletError::InvalidState(format!(
                "transaction is already {} and cannot become {}",
                self.as_str(),
                next.as_str()
            )));
        }
        if next == TransactionStatus::Pending {
            return Err(WalletError::InvalidState(
                "transaction cannot transition back to pending".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ledger entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub operation: Json<Operation>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl WalletTransaction {
    pub fn status(&self) -> WalletResult<TransactionStatus> {
        TransactionStatus::parse(&self.status)
    }

    pub fn operation(&self) -> &Operation {
        &self.operation.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_moves_to_either_terminal_state() {
        let pending = TransactionStatus::Pending;
        assert!(pending
            .ensure_can_transition_to(TransactionStatus::Success)
            .is_ok());
        assert!(pending
            .ensure_can_transition_to(TransactionStatus::Canceled)
            .is_ok());
    }

    #[test]
    fn terminal_states_are_frozen() {
        for terminal in [TransactionStatus::Success, TransactionStatus::Canceled] {
            for next in [
                TransactionStatus::Pending,
                TransactionStatus::Success,
                TransactionStatus::Canceled,
            ] {
                assert!(
                    terminal.ensure_can_transition_to(next).is_err(),
                    "{terminal} -> {next} must fail"
                );
            }
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        assert!(TransactionStatus::Pending
            .ensure_can_transition_to(TransactionStatus::Pending)
            .is_err());
    }

    #[test]
    fn status_round_trip() {
        for s in ["pending", "success", "canceled"] {
            assert_eq!(TransactionStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(TransactionStatus::parse("failed").is_err());
    }
}
