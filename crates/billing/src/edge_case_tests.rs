// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge-case tests for the billing system
//!
//! Boundary conditions in:
//! - Charge allocation between wallet and gateway
//! - Subscription lifecycle windows and outcome transitions
//! - Payment retry eligibility
//! - Gateway event classification

#[cfg(test)]
mod allocation_tests {
    use parley_shared::MIN_CHARGE_CENTS;
    use parley_wallet::allocate;

    // =========================================================================
    // Remainder exactly one cent under the gateway minimum
    // =========================================================================
    #[test]
    fn remainder_of_99_is_padded() {
        let split = allocate(901, 1_000).unwrap();
        assert_eq!(split.balance_amount, 900);
        assert_eq!(split.charge_amount, MIN_CHARGE_CENTS);
    }

    // =========================================================================
    // Remainder of exactly one cent still pads to the minimum
    // =========================================================================
    #[test]
    fn remainder_of_1_is_padded() {
        let split = allocate(999, 1_000).unwrap();
        assert_eq!(split.balance_amount, 900);
        assert_eq!(split.charge_amount, MIN_CHARGE_CENTS);
    }

    // =========================================================================
    // Amount exactly at the minimum with an empty wallet
    // =========================================================================
    #[test]
    fn minimum_amount_all_external() {
        let split = allocate(0, MIN_CHARGE_CENTS).unwrap();
        assert_eq!(split.balance_amount, 0);
        assert_eq!(split.charge_amount, MIN_CHARGE_CENTS);
    }

    // =========================================================================
    // Balance of one cent forces a padded charge
    // =========================================================================
    #[test]
    fn tiny_balance_still_pads() {
        // 1 cent of balance against a 100 charge: remainder 99 < minimum,
        // so the wallet portion drops to 0.
        let split = allocate(1, 100).unwrap();
        assert_eq!(split.balance_amount, 0);
        assert_eq!(split.charge_amount, 100);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use parley_shared::PaymentOutcome;
    use time::macros::datetime;
    use time::Duration;

    use crate::lifecycle::{
        grace_deadline, outcome_effect, period_end, BillingInterval, PeriodState,
        SubscriptionState, RETRY_CANCEL_AFTER,
    };

    // =========================================================================
    // Every (state, outcome) pair produces a consistent effect
    // =========================================================================
    #[test]
    fn transition_matrix_is_total() {
        let states = [
            SubscriptionState::Started,
            SubscriptionState::GracePeriod,
            SubscriptionState::Retrying,
            SubscriptionState::Canceled,
            SubscriptionState::Expired,
        ];
        let outcomes = [
            PaymentOutcome::Success,
            PaymentOutcome::Failing,
            PaymentOutcome::ActionNeeded,
            PaymentOutcome::Canceled,
        ];

        for state in states {
            for outcome in outcomes {
                for period_index in [1, 2, 10] {
                    let effect = outcome_effect(state, outcome, period_index);
                    // The billing clock only ever restarts on recovery out
                    // of retrying.
                    if effect.reset_period_start {
                        assert_eq!(state, SubscriptionState::Retrying);
                        assert_eq!(outcome, PaymentOutcome::Success);
                    }
                    // Action-needed never touches state.
                    if outcome == PaymentOutcome::ActionNeeded {
                        assert_eq!(effect.period_state, None);
                        assert_eq!(effect.subscription_state, None);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Grace only ever starts from `started`, and never for the first period
    // =========================================================================
    #[test]
    fn grace_entry_conditions() {
        for state in [
            SubscriptionState::GracePeriod,
            SubscriptionState::Retrying,
            SubscriptionState::Canceled,
        ] {
            let effect = outcome_effect(state, PaymentOutcome::Failing, 5);
            assert_ne!(
                effect.subscription_state,
                Some(SubscriptionState::GracePeriod),
                "{state:?} must not re-enter grace on failure"
            );
        }
        assert_eq!(
            outcome_effect(SubscriptionState::Started, PaymentOutcome::Failing, 1)
                .subscription_state,
            None
        );
    }

    // =========================================================================
    // A full failure-and-recovery sequence
    // =========================================================================
    #[test]
    fn grace_then_retry_then_recovery() {
        // Failure on period 3 while started.
        let failed = outcome_effect(SubscriptionState::Started, PaymentOutcome::Failing, 3);
        assert_eq!(
            failed.subscription_state,
            Some(SubscriptionState::GracePeriod)
        );
        assert_eq!(failed.period_state, Some(PeriodState::Failing));

        // Time passes; the worker moves grace_period -> retrying. A late
        // success out of retrying recovers and restarts the clock.
        let recovered = outcome_effect(SubscriptionState::Retrying, PaymentOutcome::Success, 3);
        assert_eq!(
            recovered.subscription_state,
            Some(SubscriptionState::Started)
        );
        assert!(recovered.reset_period_start);
    }

    // =========================================================================
    // Calendar arithmetic across awkward month boundaries
    // =========================================================================
    #[test]
    fn month_end_chain_stays_stable() {
        // Jan 31 -> Feb 29 (leap) -> Mar 29: once clamped, the day sticks.
        let jan = datetime!(2024-01-31 09:00 UTC);
        let feb = period_end(jan, BillingInterval::Month);
        assert_eq!(feb, datetime!(2024-02-29 09:00 UTC));
        let mar = period_end(feb, BillingInterval::Month);
        assert_eq!(mar, datetime!(2024-03-29 09:00 UTC));
    }

    // =========================================================================
    // Grace and forced-cancel windows in sequence
    // =========================================================================
    #[test]
    fn window_ordering() {
        let start = datetime!(2024-06-01 00:00 UTC);
        for interval in [BillingInterval::Week, BillingInterval::Month] {
            let grace = grace_deadline(start, interval);
            assert!(grace > start);
            assert!(start + RETRY_CANCEL_AFTER > grace);
        }
        assert_eq!(RETRY_CANCEL_AFTER, Duration::days(60));
    }
}

#[cfg(test)]
mod scheduler_tests {
    use time::macros::datetime;
    use time::Duration;

    use crate::scheduler::{should_attempt, IMMEDIATE_FAILURES, RETRY_COOLDOWN};

    // =========================================================================
    // Exactly at the cooldown boundary
    // =========================================================================
    #[test]
    fn cooldown_boundary_is_inclusive() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let at_boundary = now - RETRY_COOLDOWN;
        assert!(should_attempt(IMMEDIATE_FAILURES, Some(at_boundary), now));
        assert!(!should_attempt(
            IMMEDIATE_FAILURES,
            Some(at_boundary + Duration::seconds(1)),
            now
        ));
    }

    // =========================================================================
    // Exactly two failures retry without a cooldown
    // =========================================================================
    #[test]
    fn immediate_retry_allowance() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let just_failed = Some(now - Duration::seconds(1));
        assert!(should_attempt(0, just_failed, now));
        assert!(should_attempt(1, just_failed, now));
        assert!(!should_attempt(2, just_failed, now));
    }
}

#[cfg(test)]
mod event_tests {
    use parley_shared::PaymentOutcome;
    use stripe::EventType;

    use crate::event_reader::outcome_for_event;

    // =========================================================================
    // The four intent events map to the four outcomes
    // =========================================================================
    #[test]
    fn intent_events_map_to_outcomes() {
        assert_eq!(
            outcome_for_event(&EventType::PaymentIntentSucceeded),
            Some(PaymentOutcome::Success)
        );
        assert_eq!(
            outcome_for_event(&EventType::PaymentIntentPaymentFailed),
            Some(PaymentOutcome::Failing)
        );
        assert_eq!(
            outcome_for_event(&EventType::PaymentIntentRequiresAction),
            Some(PaymentOutcome::ActionNeeded)
        );
        assert_eq!(
            outcome_for_event(&EventType::PaymentIntentCanceled),
            Some(PaymentOutcome::Canceled)
        );
    }

    // =========================================================================
    // Unrelated events are skipped, not errors
    // =========================================================================
    #[test]
    fn unrelated_events_are_skipped() {
        assert_eq!(outcome_for_event(&EventType::CustomerCreated), None);
        assert_eq!(outcome_for_event(&EventType::InvoicePaid), None);
    }
}

#[cfg(test)]
mod payment_state_tests {
    use crate::payments::PaymentState;

    // =========================================================================
    // Terminal set is exactly success and canceled
    // =========================================================================
    #[test]
    fn terminal_states() {
        assert!(PaymentState::Success.is_terminal());
        assert!(PaymentState::Canceled.is_terminal());
        assert!(!PaymentState::Pending.is_terminal());
        assert!(!PaymentState::Failing.is_terminal());
        assert!(!PaymentState::ActionRequired.is_terminal());
    }

    #[test]
    fn state_round_trip() {
        for s in ["pending", "failing", "action_required", "success", "canceled"] {
            assert_eq!(PaymentState::parse(s).unwrap().as_str(), s);
        }
        assert!(PaymentState::parse("declined").is_err());
    }
}
