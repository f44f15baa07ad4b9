//! Wallet error types

use parley_shared::AmountError;

/// Errors from ledger operations.
///
/// `InsufficientFunds` is deliberately distinct from generic validation: it is
/// user-visible and callers surface it as such.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("transfer to self is not allowed")]
    SelfTransfer,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for WalletError {
    fn from(e: sqlx::Error) -> Self {
        WalletError::Database(e.to_string())
    }
}

pub type WalletResult<T> = Result<T, WalletError>;
