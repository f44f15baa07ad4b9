// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Parley Wallet Ledger
//!
//! Per-user balances plus an append-mostly transaction log.
//!
//! ## Features
//!
//! - **Allocation**: pure rule splitting a charge between wallet balance and
//!   the external gateway
//! - **Ledger**: instant and two-phase deposits, transfers, subscription
//!   charges and purchases, with a one-way status machine per transaction
//! - **Updates**: ordered per-user update events for the live-update layer
//!
//! All mutations run inside a single database transaction; concurrent calls
//! racing on the same wallet are linearized by row locks, and the loser's
//! precondition checks fail cleanly.

pub mod allocation;
pub mod error;
pub mod ledger;
pub mod transactions;

pub use allocation::{allocate, Split};
pub use error::{WalletError, WalletResult};
pub use ledger::{Wallet, WalletService};
pub use transactions::{TransactionStatus, WalletTransaction};
