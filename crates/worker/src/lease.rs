//! Cluster singleton lease
//!
//! The schedulers must run on exactly one worker across the fleet. A
//! session-scoped Postgres advisory lock on a fixed key is the lease: the
//! holder keeps its connection open for the process lifetime, and the lock
//! disappears with the session if the holder dies.

use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::info;

/// Fixed advisory-lock key shared by every worker instance.
const LEASE_KEY: i64 = 7_241_530_019;

/// The held lease. Dropping it releases the lock.
pub struct SingletonLease {
    _conn: PoolConnection<Postgres>,
}

/// Try to take the lease once.
pub async fn try_acquire(pool: &PgPool) -> anyhow::Result<Option<SingletonLease>> {
    let mut conn = pool.acquire().await?;
    let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(LEASE_KEY)
        .fetch_one(&mut *conn)
        .await?;

    Ok(locked.then_some(SingletonLease { _conn: conn }))
}

/// Block until this instance holds the lease, polling every 30 seconds.
pub async fn acquire(pool: &PgPool) -> anyhow::Result<SingletonLease> {
    loop {
        if let Some(lease) = try_acquire(pool).await? {
            info!("singleton lease acquired");
            return Ok(lease);
        }
        info!("another worker holds the lease, standing by");
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
}
