//! Gateway event reconciliation
//!
//! Turns gateway payment-intent events into in-order calls to the outcome
//! router. Two delivery paths share the logic here: the webhook handler
//! (push) and the polled reader (pull). Both claim each event atomically in
//! `gateway_events` before applying it, and the intent registry's terminal
//! booleans make a double-delivered outcome a no-op.
//!
//! The polled reader keeps a committed cursor (unix seconds) and resumes
//! from it; bumping [`READER_VERSION`] resets the cursor on the next poll.

use parley_shared::PaymentOutcome;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType};

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::payments::{PaymentService, PaymentState};
use crate::router::OutcomeRouter;

/// Bump to force every deployment to re-read the event window from scratch.
pub const READER_VERSION: i32 = 1;

const CURSOR_NAME: &str = "gateway";
const PAGE_SIZE: u64 = 100;

/// Outcome classification for a gateway event type, if it carries one.
pub fn outcome_for_event(event_type: &EventType) -> Option<PaymentOutcome> {
    match event_type {
        EventType::PaymentIntentSucceeded => Some(PaymentOutcome::Success),
        EventType::PaymentIntentPaymentFailed => Some(PaymentOutcome::Failing),
        EventType::PaymentIntentRequiresAction => Some(PaymentOutcome::ActionNeeded),
        EventType::PaymentIntentCanceled => Some(PaymentOutcome::Canceled),
        _ => None,
    }
}

/// Apply one verified gateway event. Returns whether an outcome was routed.
///
/// Terminal outcomes flip the intent registry first; if the intent is
/// unknown or already terminal, the event is a duplicate (or belongs to a
/// foreign system) and is skipped.
pub(crate) async fn apply_gateway_event(
    payments: &PaymentService,
    router: &OutcomeRouter,
    event: &Event,
) -> BillingResult<bool> {
    let Some(outcome) = outcome_for_event(&event.type_) else {
        tracing::debug!(event_type = %event.type_, event_id = %event.id, "unhandled event type");
        return Ok(false);
    };

    let EventObject::PaymentIntent(intent) = &event.data.object else {
        tracing::warn!(
            event_type = %event.type_,
            event_id = %event.id,
            "payment-intent event without an intent object"
        );
        return Ok(false);
    };
    let intent_id = intent.id.to_string();

    match outcome {
        PaymentOutcome::Success => {
            if !payments.intent_success(&intent_id).await? {
                return Ok(false);
            }
        }
        PaymentOutcome::Canceled => {
            if !payments.intent_cancel(&intent_id).await? {
                return Ok(false);
            }
        }
        PaymentOutcome::Failing | PaymentOutcome::ActionNeeded => {
            if payments.get_intent(&intent_id).await?.is_none() {
                return Ok(false);
            }
        }
    }

    let Some(payment) = payments.find_by_intent(&intent_id).await? else {
        tracing::warn!(intent_id = %intent_id, "no payment for reconciled intent");
        return Ok(false);
    };

    let state = match outcome {
        PaymentOutcome::Success => PaymentState::Success,
        PaymentOutcome::Failing => PaymentState::Failing,
        PaymentOutcome::ActionNeeded => PaymentState::ActionRequired,
        PaymentOutcome::Canceled => PaymentState::Canceled,
    };
    payments.set_state(payment.id, state).await?;
    router.route(&payment, outcome).await?;
    Ok(true)
}

/// Atomically claim exclusive processing rights for an event. The
/// `INSERT ... ON CONFLICT ... RETURNING` either wins the claim or reclaims
/// an event stuck in `processing` for over 30 minutes.
pub(crate) async fn claim_event(
    pool: &PgPool,
    event_id: &str,
    event_type: &str,
    event_timestamp: i64,
) -> BillingResult<bool> {
    let claimed: Option<(String,)> = sqlx::query_as(
        "INSERT INTO gateway_events \
             (event_id, event_type, event_timestamp, processing_result, processing_started_at) \
         VALUES ($1, $2, $3, 'processing', NOW()) \
         ON CONFLICT (event_id) DO UPDATE SET \
             processing_result = 'processing', \
             processing_started_at = NOW() \
         WHERE gateway_events.processing_result = 'processing' \
           AND gateway_events.processing_started_at < NOW() - INTERVAL '30 minutes' \
         RETURNING event_id",
    )
    .bind(event_id)
    .bind(event_type)
    .bind(event_timestamp)
    .fetch_optional(pool)
    .await?;

    Ok(claimed.is_some())
}

/// Record how processing a claimed event went.
pub(crate) async fn mark_event(pool: &PgPool, event_id: &str, error: Option<&str>) {
    let result = if error.is_some() { "error" } else { "success" };
    if let Err(e) = sqlx::query(
        "UPDATE gateway_events SET processing_result = $2, error_message = $3 \
         WHERE event_id = $1",
    )
    .bind(event_id)
    .bind(result)
    .bind(error)
    .execute(pool)
    .await
    {
        tracing::error!(event_id = %event_id, error = %e, "failed to update event record");
    }
}

/// Cursor-tracking polled reader over the gateway's event list.
#[derive(Clone)]
pub struct GatewayEventReader {
    pool: PgPool,
    stripe: StripeClient,
    payments: PaymentService,
    router: OutcomeRouter,
}

impl GatewayEventReader {
    pub fn new(
        pool: PgPool,
        stripe: StripeClient,
        payments: PaymentService,
        router: OutcomeRouter,
    ) -> Self {
        Self {
            pool,
            stripe,
            payments,
            router,
        }
    }

    /// One poll pass: list events from the committed cursor, apply them in
    /// created-order, advance the cursor per event. Returns how many
    /// outcomes were routed.
    pub async fn poll(&self) -> BillingResult<usize> {
        let cursor = self.load_cursor().await?;
        let mut events = self.stripe.list_events_since(cursor, PAGE_SIZE).await?;
        events.sort_by_key(|e| (e.created, e.id.to_string()));

        let mut applied = 0;
        for event in &events {
            let event_id = event.id.to_string();
            if claim_event(&self.pool, &event_id, &event.type_.to_string(), event.created).await? {
                match apply_gateway_event(&self.payments, &self.router, event).await {
                    Ok(routed) => {
                        mark_event(&self.pool, &event_id, None).await;
                        if routed {
                            applied += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(event_id = %event_id, error = %e, "event apply failed");
                        mark_event(&self.pool, &event_id, Some(&e.to_string())).await;
                    }
                }
            }
            self.commit_cursor(event.created).await?;
        }

        if applied > 0 {
            tracing::info!(applied = applied, "gateway events reconciled");
        }
        Ok(applied)
    }

    /// Committed cursor, reset to zero when the reader version bumps.
    async fn load_cursor(&self) -> BillingResult<i64> {
        sqlx::query(
            "INSERT INTO event_cursors (name, version, cursor_ts) VALUES ($1, $2, 0) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(CURSOR_NAME)
        .bind(READER_VERSION)
        .execute(&self.pool)
        .await?;

        let (version, cursor_ts): (i32, i64) =
            sqlx::query_as("SELECT version, cursor_ts FROM event_cursors WHERE name = $1")
                .bind(CURSOR_NAME)
                .fetch_one(&self.pool)
                .await?;

        if version != READER_VERSION {
            sqlx::query("UPDATE event_cursors SET version = $2, cursor_ts = 0 WHERE name = $1")
                .bind(CURSOR_NAME)
                .bind(READER_VERSION)
                .execute(&self.pool)
                .await?;
            tracing::info!(
                old_version = version,
                new_version = READER_VERSION,
                "event cursor reset"
            );
            return Ok(0);
        }
        Ok(cursor_ts)
    }

    async fn commit_cursor(&self, event_ts: i64) -> BillingResult<()> {
        sqlx::query(
            "UPDATE event_cursors SET cursor_ts = GREATEST(cursor_ts, $2) WHERE name = $1",
        )
        .bind(CURSOR_NAME)
        .bind(event_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
