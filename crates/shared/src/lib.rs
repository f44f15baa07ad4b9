// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Parley shared domain primitives
//!
//! Types used across the wallet ledger, the billing engine and the worker:
//!
//! - **Money**: integer minor-currency amounts (cents) and their validation
//! - **Operations**: the tagged union describing what a transaction or payment moves
//! - **Outcomes**: the four classifications a gateway charge can reach
//! - **Updates**: the fire-and-forget per-user update-event contract

pub mod money;
pub mod operation;
pub mod outcome;
pub mod updates;

pub use money::{ensure_amount, ensure_split, AmountError, Cents, MIN_CHARGE_CENTS};
pub use operation::{Operation, OperationKind};
pub use outcome::PaymentOutcome;
pub use updates::{LogNotifier, UpdateNotifier, UserUpdate};
