//! Money allocation rule
//!
//! Decides how much of a charge is covered by wallet balance and how much
//! must go to the external gateway. The gateway refuses charges below
//! [`MIN_CHARGE_CENTS`], so a split never produces a charge portion in
//! `1..100`: when the remainder would fall under the minimum, the wallet
//! portion is reduced until the charge portion is exactly the minimum.

use parley_shared::{ensure_amount, ensure_split, Cents, MIN_CHARGE_CENTS};

use crate::error::{WalletError, WalletResult};

/// Result of [`allocate`]: how a charge is covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    /// Portion taken from the wallet balance.
    pub balance_amount: Cents,
    /// Portion charged through the gateway.
    pub charge_amount: Cents,
}

/// Split `amount` between `wallet_balance` and the gateway.
///
/// `amount` must be at least [`MIN_CHARGE_CENTS`]; `wallet_balance` must not
/// be negative. The returned portions always sum to `amount`, and the charge
/// portion is either zero or at least [`MIN_CHARGE_CENTS`].
pub fn allocate(wallet_balance: Cents, amount: Cents) -> WalletResult<Split> {
    ensure_amount(amount).map_err(WalletError::InvalidAmount)?;
    if amount < MIN_CHARGE_CENTS {
        return Err(WalletError::InvalidAmount(
            parley_shared::AmountError::BelowMinimum(amount),
        ));
    }
    if wallet_balance < 0 {
        return Err(WalletError::Internal(format!(
            "wallet balance is negative: {wallet_balance}"
        )));
    }

    let split = if wallet_balance == 0 {
        Split {
            balance_amount: 0,
            charge_amount: amount,
        }
    } else if wallet_balance >= amount {
        Split {
            balance_amount: amount,
            charge_amount: 0,
        }
    } else if amount - wallet_balance < MIN_CHARGE_CENTS {
        // Remainder is under the gateway minimum: shrink the wallet portion
        // so the charge is exactly the minimum.
        Split {
            balance_amount: amount - MIN_CHARGE_CENTS,
            charge_amount: MIN_CHARGE_CENTS,
        }
    } else {
        Split {
            balance_amount: wallet_balance,
            charge_amount: amount - wallet_balance,
        }
    };

    ensure_split(split.balance_amount, split.charge_amount).map_err(WalletError::InvalidAmount)?;
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_wallet_charges_everything() {
        let split = allocate(0, 500).unwrap();
        assert_eq!(split.balance_amount, 0);
        assert_eq!(split.charge_amount, 500);
    }

    #[test]
    fn full_cover_charges_nothing() {
        let split = allocate(500, 500).unwrap();
        assert_eq!(split.balance_amount, 500);
        assert_eq!(split.charge_amount, 0);

        let split = allocate(1_000, 500).unwrap();
        assert_eq!(split.balance_amount, 500);
        assert_eq!(split.charge_amount, 0);
    }

    #[test]
    fn plain_split_uses_whole_balance() {
        let split = allocate(300, 500).unwrap();
        assert_eq!(split.balance_amount, 300);
        assert_eq!(split.charge_amount, 200);
    }

    #[test]
    fn small_remainder_pads_charge_to_minimum() {
        // Remainder would be 50, under the gateway minimum of 100.
        let split = allocate(450, 500).unwrap();
        assert_eq!(split.balance_amount, 400);
        assert_eq!(split.charge_amount, MIN_CHARGE_CENTS);

        // Remainder of exactly 99 also pads.
        let split = allocate(401, 500).unwrap();
        assert_eq!(split.balance_amount, 400);
        assert_eq!(split.charge_amount, MIN_CHARGE_CENTS);
    }

    #[test]
    fn remainder_exactly_minimum_is_untouched() {
        let split = allocate(400, 500).unwrap();
        assert_eq!(split.balance_amount, 400);
        assert_eq!(split.charge_amount, 100);
    }

    #[test]
    fn portions_always_sum_to_amount() {
        for balance in [0, 1, 99, 100, 101, 399, 400, 401, 499, 500, 10_000] {
            for amount in [100, 101, 199, 200, 500, 1_000, 99_999] {
                let split = allocate(balance, amount).unwrap();
                assert_eq!(
                    split.balance_amount + split.charge_amount,
                    amount,
                    "balance={balance} amount={amount}"
                );
                assert!(
                    split.charge_amount == 0 || split.charge_amount >= MIN_CHARGE_CENTS,
                    "balance={balance} amount={amount} charge={}",
                    split.charge_amount
                );
                assert!(split.balance_amount >= 0);
            }
        }
    }

    #[test]
    fn amounts_below_minimum_rejected() {
        assert!(allocate(0, 99).is_err());
        assert!(allocate(0, 0).is_err());
        assert!(allocate(0, -100).is_err());
    }
}
