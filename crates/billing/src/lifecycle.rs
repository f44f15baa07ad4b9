//! Subscription lifecycle rules
//!
//! Pure state and calendar logic for the billing engine: interval math,
//! grace windows, and the effect of a payment outcome on the subscription
//! and its current period. Keeping this free of I/O lets the transition
//! table be tested exhaustively.

use parley_shared::PaymentOutcome;
use time::{Date, Duration, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// Grace window after a failed charge, before the subscription suspends.
pub const GRACE_PERIOD_WEEKLY: Duration = Duration::days(6);
pub const GRACE_PERIOD_MONTHLY: Duration = Duration::days(16);

/// How long a suspended subscription may sit in `retrying` before its
/// in-flight payment is flagged for cancellation.
pub const RETRY_CANCEL_AFTER: Duration = Duration::days(60);

/// How close to the period end the next period is created and charged.
pub const RENEW_WINDOW: Duration = Duration::days(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingInterval {
    Week,
    Month,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "week" => Ok(BillingInterval::Week),
            "month" => Ok(BillingInterval::Month),
            other => Err(BillingError::Validation(format!(
                "unknown billing interval '{other}'"
            ))),
        }
    }

    pub fn grace_period(&self) -> Duration {
        match self {
            BillingInterval::Week => GRACE_PERIOD_WEEKLY,
            BillingInterval::Month => GRACE_PERIOD_MONTHLY,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Started,
    GracePeriod,
    Retrying,
    Canceled,
    Expired,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Started => "started",
            SubscriptionState::GracePeriod => "grace_period",
            SubscriptionState::Retrying => "retrying",
            SubscriptionState::Canceled => "canceled",
            SubscriptionState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "started" => Ok(SubscriptionState::Started),
            "grace_period" => Ok(SubscriptionState::GracePeriod),
            "retrying" => Ok(SubscriptionState::Retrying),
            "canceled" => Ok(SubscriptionState::Canceled),
            "expired" => Ok(SubscriptionState::Expired),
            other => Err(BillingError::Internal(format!(
                "unknown subscription state '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodState {
    Pending,
    Failing,
    Success,
    Canceling,
    Canceled,
}

impl PeriodState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodState::Pending => "pending",
            PeriodState::Failing => "failing",
            PeriodState::Success => "success",
            PeriodState::Canceling => "canceling",
            PeriodState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(PeriodState::Pending),
            "failing" => Ok(PeriodState::Failing),
            "success" => Ok(PeriodState::Success),
            "canceling" => Ok(PeriodState::Canceling),
            "canceled" => Ok(PeriodState::Canceled),
            other => Err(BillingError::Internal(format!(
                "unknown period state '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PeriodState::Success | PeriodState::Canceled)
    }
}

impl std::fmt::Display for PeriodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// End of a billing period. A month is "same day next calendar month", with
/// the day clamped to the target month's length; a week is exactly 7 days.
pub fn period_end(start: OffsetDateTime, interval: BillingInterval) -> OffsetDateTime {
    match interval {
        BillingInterval::Week => start + Duration::days(7),
        BillingInterval::Month => add_one_month(start),
    }
}

/// Instant at which a grace period runs out.
pub fn grace_deadline(period_start: OffsetDateTime, interval: BillingInterval) -> OffsetDateTime {
    period_start + interval.grace_period()
}

fn add_one_month(at: OffsetDateTime) -> OffsetDateTime {
    let date = at.date();
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        m => (date.year(), m.next()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(next) => at.replace_date(next),
        // Unreachable: the day is clamped to the target month's length.
        Err(_) => at + Duration::days(30),
    }
}

/// What a payment outcome does to the current period and the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutcomeEffect {
    pub period_state: Option<PeriodState>,
    pub subscription_state: Option<SubscriptionState>,
    /// Restart the billing clock from now (recovery out of `retrying`).
    pub reset_period_start: bool,
}

/// Transition table for a gateway outcome against the current period.
///
/// The caller has already verified that the outcome targets the current
/// period and that the period is not terminal.
pub fn outcome_effect(
    state: SubscriptionState,
    outcome: PaymentOutcome,
    period_index: i32,
) -> OutcomeEffect {
    match outcome {
        PaymentOutcome::Success => OutcomeEffect {
            period_state: Some(PeriodState::Success),
            subscription_state: match state {
                SubscriptionState::GracePeriod | SubscriptionState::Retrying => {
                    Some(SubscriptionState::Started)
                }
                _ => None,
            },
            reset_period_start: state == SubscriptionState::Retrying,
        },
        PaymentOutcome::Failing => OutcomeEffect {
            period_state: Some(PeriodState::Failing),
            // A subscription that never had a successful period does not get
            // a grace period; it expires on schedule instead.
            subscription_state: if state == SubscriptionState::Started && period_index > 1 {
                Some(SubscriptionState::GracePeriod)
            } else {
                None
            },
            reset_period_start: false,
        },
        PaymentOutcome::ActionNeeded => OutcomeEffect::default(),
        PaymentOutcome::Canceled => OutcomeEffect {
            period_state: Some(PeriodState::Canceled),
            subscription_state: if state == SubscriptionState::Retrying {
                Some(SubscriptionState::Expired)
            } else {
                None
            },
            reset_period_start: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn week_period_is_exactly_seven_days() {
        let start = datetime!(2024-03-01 12:00 UTC);
        assert_eq!(
            period_end(start, BillingInterval::Week),
            datetime!(2024-03-08 12:00 UTC)
        );
    }

    #[test]
    fn month_period_keeps_the_day() {
        let start = datetime!(2024-03-15 08:30 UTC);
        assert_eq!(
            period_end(start, BillingInterval::Month),
            datetime!(2024-04-15 08:30 UTC)
        );
    }

    #[test]
    fn month_period_clamps_to_shorter_months() {
        let start = datetime!(2024-01-31 00:00 UTC);
        // 2024 is a leap year.
        assert_eq!(
            period_end(start, BillingInterval::Month),
            datetime!(2024-02-29 00:00 UTC)
        );

        let start = datetime!(2023-01-31 00:00 UTC);
        assert_eq!(
            period_end(start, BillingInterval::Month),
            datetime!(2023-02-28 00:00 UTC)
        );
    }

    #[test]
    fn month_period_wraps_the_year() {
        let start = datetime!(2024-12-10 00:00 UTC);
        assert_eq!(
            period_end(start, BillingInterval::Month),
            datetime!(2025-01-10 00:00 UTC)
        );
    }

    #[test]
    fn grace_windows_depend_on_interval() {
        let start = datetime!(2024-03-01 00:00 UTC);
        assert_eq!(
            grace_deadline(start, BillingInterval::Week),
            datetime!(2024-03-07 00:00 UTC)
        );
        assert_eq!(
            grace_deadline(start, BillingInterval::Month),
            datetime!(2024-03-17 00:00 UTC)
        );
    }

    #[test]
    fn first_period_failure_never_starts_grace() {
        let effect = outcome_effect(SubscriptionState::Started, PaymentOutcome::Failing, 1);
        assert_eq!(effect.period_state, Some(PeriodState::Failing));
        assert_eq!(effect.subscription_state, None);
    }

    #[test]
    fn later_failure_starts_grace() {
        let effect = outcome_effect(SubscriptionState::Started, PaymentOutcome::Failing, 2);
        assert_eq!(
            effect.subscription_state,
            Some(SubscriptionState::GracePeriod)
        );
    }

    #[test]
    fn success_recovers_from_grace() {
        let effect = outcome_effect(SubscriptionState::GracePeriod, PaymentOutcome::Success, 3);
        assert_eq!(effect.subscription_state, Some(SubscriptionState::Started));
        assert!(!effect.reset_period_start);
    }

    #[test]
    fn success_out_of_retrying_restarts_the_clock() {
        let effect = outcome_effect(SubscriptionState::Retrying, PaymentOutcome::Success, 3);
        assert_eq!(effect.subscription_state, Some(SubscriptionState::Started));
        assert!(effect.reset_period_start);
    }

    #[test]
    fn cancel_out_of_retrying_expires() {
        let effect = outcome_effect(SubscriptionState::Retrying, PaymentOutcome::Canceled, 3);
        assert_eq!(effect.period_state, Some(PeriodState::Canceled));
        assert_eq!(effect.subscription_state, Some(SubscriptionState::Expired));
    }

    #[test]
    fn action_needed_changes_nothing() {
        let effect = outcome_effect(SubscriptionState::Started, PaymentOutcome::ActionNeeded, 2);
        assert_eq!(effect, OutcomeEffect::default());
    }

    #[test]
    fn plain_success_keeps_started() {
        let effect = outcome_effect(SubscriptionState::Started, PaymentOutcome::Success, 2);
        assert_eq!(effect.period_state, Some(PeriodState::Success));
        assert_eq!(effect.subscription_state, None);
    }
}
