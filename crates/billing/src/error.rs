//! Billing error types
//!
//! Taxonomy: validation and precondition failures are rejected synchronously
//! with no state change; insufficient funds surfaces from the wallet crate
//! unchanged; gateway failures are classified at the call site (see
//! `client::classify_charge_error`) and only unknown ones end up here as
//! `StripeApi`, rethrown rather than swallowed.

use parley_shared::AmountError;
use parley_wallet::WalletError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("stripe api error: {0}")]
    StripeApi(String),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
