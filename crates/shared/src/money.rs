//! Integer money amounts
//!
//! All amounts in the system are minor-currency units (cents) in a single
//! currency, carried as `i64`. Validation happens at the edges: every caller
//! of the ledger or the payment registry goes through [`ensure_amount`] or
//! [`ensure_split`] before any state is touched.

use serde::{Deserialize, Serialize};

/// Minor-currency units (cents).
pub type Cents = i64;

/// Smallest amount the gateway will charge, in cents.
pub const MIN_CHARGE_CENTS: Cents = 100;

/// Rejected amount values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum AmountError {
    #[error("amount must be positive, got {0}")]
    NotPositive(Cents),
    #[error("amount portion must not be negative, got {0}")]
    Negative(Cents),
    #[error("amount must be at least {MIN_CHARGE_CENTS}, got {0}")]
    BelowMinimum(Cents),
    #[error("amount overflows")]
    Overflow,
}

/// Validate a single chargeable amount: strictly positive.
pub fn ensure_amount(amount: Cents) -> Result<Cents, AmountError> {
    if amount <= 0 {
        return Err(AmountError::NotPositive(amount));
    }
    Ok(amount)
}

/// Validate a wallet/gateway split: both portions non-negative, their sum
/// positive and free of overflow.
pub fn ensure_split(balance_amount: Cents, charge_amount: Cents) -> Result<Cents, AmountError> {
    if balance_amount < 0 {
        return Err(AmountError::Negative(balance_amount));
    }
    if charge_amount < 0 {
        return Err(AmountError::Negative(charge_amount));
    }
    let total = balance_amount
        .checked_add(charge_amount)
        .ok_or(AmountError::Overflow)?;
    ensure_amount(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_amount_passes() {
        assert_eq!(ensure_amount(100), Ok(100));
        assert_eq!(ensure_amount(1), Ok(1));
    }

    #[test]
    fn zero_and_negative_amounts_rejected() {
        assert_eq!(ensure_amount(0), Err(AmountError::NotPositive(0)));
        assert_eq!(ensure_amount(-5), Err(AmountError::NotPositive(-5)));
    }

    #[test]
    fn split_requires_positive_total() {
        assert_eq!(ensure_split(0, 100), Ok(100));
        assert_eq!(ensure_split(100, 0), Ok(100));
        assert_eq!(ensure_split(0, 0), Err(AmountError::NotPositive(0)));
        assert_eq!(ensure_split(-1, 100), Err(AmountError::Negative(-1)));
        assert_eq!(ensure_split(100, -1), Err(AmountError::Negative(-1)));
    }

    #[test]
    fn split_overflow_rejected() {
        assert_eq!(ensure_split(i64::MAX, 1), Err(AmountError::Overflow));
    }
}
