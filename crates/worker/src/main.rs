//! Parley background worker
//!
//! Runs the scheduled jobs of the monetary core:
//! - Payment execution poll (every minute)
//! - Cooperative payment cancellation sweep (every 5 minutes)
//! - Subscription scheduling (every 5 minutes)
//! - Gateway event reconciliation (every minute)
//! - Invariant checks (daily at 3:00 UTC)
//!
//! A Postgres advisory-lock lease makes this a cluster singleton: only one
//! worker instance runs the jobs at a time.

mod lease;

use std::sync::Arc;
use std::time::Duration;

use parley_billing::{BillingService, InvariantChecker};
use parley_shared::LogNotifier;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool.
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Parley worker");

    let pool = create_db_pool().await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations applied");

    // Hold the lease for the process lifetime.
    let _lease = lease::acquire(&pool).await?;

    let billing = match BillingService::from_env(pool.clone(), Arc::new(LogNotifier)) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without gateway credentials there is nothing to drive.
            warn!(error = %e, "failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: payment execution poll (every minute)
    let payment_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = payment_billing.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                match billing.scheduler.run_once(now).await {
                    Ok(claimed) if claimed > 0 => {
                        info!(claimed = claimed, "payment poll complete")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "payment poll failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: payment execution poll (every minute)");

    // Job 2: cooperative cancellation sweep (every 5 minutes)
    let cancel_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = cancel_billing.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                match billing.scheduler.sweep_cancellations(now).await {
                    Ok(canceled) if canceled > 0 => {
                        info!(canceled = canceled, "cancellation sweep complete")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "cancellation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: cancellation sweep (every 5 minutes)");

    // Job 3: subscription scheduling (every 5 minutes)
    let subs_billing = billing.clone();
    scheduler
        .add(Job::new_async("30 */5 * * * *", move |_uuid, _l| {
            let billing = subs_billing.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                if let Err(e) = billing.subscriptions.do_scheduling(now).await {
                    error!(error = %e, "subscription scheduling failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: subscription scheduling (every 5 minutes)");

    // Job 4: gateway event reconciliation (every minute)
    let events_billing = billing.clone();
    scheduler
        .add(Job::new_async("30 * * * * *", move |_uuid, _l| {
            let billing = events_billing.clone();
            Box::pin(async move {
                if let Err(e) = billing.events.poll().await {
                    error!(error = %e, "event reconciliation failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: gateway event reconciliation (every minute)");

    // Job 5: invariant checks (daily at 3:00 UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "invariant checks passed")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "invariant violation"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: invariant checks (daily at 3:00 UTC)");

    // Job 6: heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // Keep the main task running; the scheduler drives jobs in background
    // tasks and the lease is held until the process exits.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
