// Integration tests - run against a real database
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! End-to-end ledger flows against a live Postgres.
//!
//! These need `DATABASE_URL` pointing at a migrated database and are ignored
//! by default:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/parley_test cargo test -- --ignored
//! ```

use std::sync::Arc;

use parley_shared::{LogNotifier, Operation, OperationKind};
use parley_wallet::{WalletError, WalletService};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

fn wallet_service(pool: PgPool) -> WalletService {
    WalletService::new(pool, Arc::new(LogNotifier))
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn deposit_then_commit_credits_exactly_once() {
    let wallet = wallet_service(test_pool().await);
    let user = Uuid::new_v4();

    let before = wallet.get_wallet(user).await.unwrap();
    assert_eq!(before.balance, 0);

    let payment_id = Uuid::new_v4();
    let tx = wallet.deposit_pending(user, 100, payment_id).await.unwrap();
    assert_eq!(tx.status, "pending");

    wallet.deposit_commit(user, tx.id).await.unwrap();
    let after = wallet.get_wallet(user).await.unwrap();
    assert_eq!(after.balance, 100);

    let settled = wallet.get_transaction(user, tx.id).await.unwrap();
    assert_eq!(settled.status, "success");

    // A second commit must fail without touching the balance.
    let err = wallet.deposit_commit(user, tx.id).await.unwrap_err();
    assert!(matches!(err, WalletError::InvalidState(_)));
    assert_eq!(wallet.get_wallet(user).await.unwrap().balance, 100);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn balance_transfer_end_to_end() {
    let wallet = wallet_service(test_pool().await);
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();

    wallet.deposit_instant(sender, 1_000).await.unwrap();
    assert_eq!(wallet.get_wallet(sender).await.unwrap().balance, 1_000);

    let (out_tx, in_tx) = wallet.transfer_balance(sender, receiver, 100).await.unwrap();

    assert_eq!(wallet.get_wallet(sender).await.unwrap().balance, 900);
    assert_eq!(wallet.get_wallet(receiver).await.unwrap().balance, 100);

    assert_eq!(out_tx.status, "success");
    assert_eq!(in_tx.status, "success");
    assert_eq!(out_tx.operation().kind(), OperationKind::TransferOut);
    assert_eq!(in_tx.operation().kind(), OperationKind::TransferIn);
    match in_tx.operation() {
        Operation::TransferIn { from, twin, .. } => {
            assert_eq!(*from, sender);
            assert_eq!(*twin, out_tx.id);
        }
        other => panic!("unexpected operation {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn insufficient_funds_changes_nothing() {
    let wallet = wallet_service(test_pool().await);
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();

    wallet.deposit_instant(sender, 50).await.unwrap();

    let err = wallet
        .transfer_balance(sender, receiver, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds));

    assert_eq!(wallet.get_wallet(sender).await.unwrap().balance, 50);
    assert_eq!(wallet.get_wallet(receiver).await.unwrap().balance, 0);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn self_transfer_is_rejected() {
    let wallet = wallet_service(test_pool().await);
    let user = Uuid::new_v4();
    wallet.deposit_instant(user, 1_000).await.unwrap();

    let err = wallet.transfer_balance(user, user, 100).await.unwrap_err();
    assert!(matches!(err, WalletError::SelfTransfer));

    let err = wallet
        .transfer_pending(user, user, 50, 100, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::SelfTransfer));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn canceled_transfer_refunds_the_wallet_portion() {
    let wallet = wallet_service(test_pool().await);
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();

    wallet.deposit_instant(sender, 300).await.unwrap();
    let (out_tx, _) = wallet
        .transfer_pending(sender, receiver, 300, 200, Uuid::new_v4())
        .await
        .unwrap();

    // The wallet portion is reserved at creation.
    assert_eq!(wallet.get_wallet(sender).await.unwrap().balance, 0);

    wallet.transfer_cancel(sender, out_tx.id).await.unwrap();
    assert_eq!(wallet.get_wallet(sender).await.unwrap().balance, 300);
    assert_eq!(wallet.get_wallet(receiver).await.unwrap().balance, 0);

    // Both legs are terminal now; a late commit must fail.
    let err = wallet.transfer_commit(sender, out_tx.id).await.unwrap_err();
    assert!(matches!(err, WalletError::InvalidState(_)));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn failing_signal_does_not_touch_the_ledger() {
    let wallet = wallet_service(test_pool().await);
    let user = Uuid::new_v4();
    let payment_id = Uuid::new_v4();

    let tx = wallet.deposit_pending(user, 500, payment_id).await.unwrap();

    // Repeated failing signals are idempotent no-ops on ledger state.
    wallet.deposit_failing(user, tx.id, payment_id).await.unwrap();
    wallet.deposit_failing(user, tx.id, payment_id).await.unwrap();

    assert_eq!(wallet.get_wallet(user).await.unwrap().balance, 0);
    let unchanged = wallet.get_transaction(user, tx.id).await.unwrap();
    assert_eq!(unchanged.status, "pending");
}
