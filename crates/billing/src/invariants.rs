//! Runnable consistency checks
//!
//! Each invariant is a real read-only SQL query that can be run after any
//! mutation or reconciliation pass. Violations carry enough context to
//! debug and a severity level for alerting.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Users affected.
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    /// Severity level.
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be moving incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: Uuid,
    balance: i64,
    balance_locked: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleDefaultsRow {
    user_id: Uuid,
    default_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnscheduledPaymentRow {
    payment_id: Uuid,
    user_id: Uuid,
    state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingPeriodRow {
    subscription_id: Uuid,
    user_id: Uuid,
    current_period_index: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct SettledWithPendingIntentRow {
    payment_id: Uuid,
    user_id: Uuid,
    payment_state: String,
    intent_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleOpenPeriodsRow {
    subscription_id: Uuid,
    user_id: Uuid,
    open_count: i64,
}

/// Service for running invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_balances_non_negative().await?);
        violations.extend(self.check_single_default_card().await?);
        violations.extend(self.check_payments_have_scheduling().await?);
        violations.extend(self.check_current_period_exists().await?);
        violations.extend(self.check_settled_payments_have_settled_intents().await?);
        violations.extend(self.check_one_open_period().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: balances never go negative and always cover the locked
    /// portion. The schema enforces this too; a violation means a write path
    /// bypassed the guarded updates.
    async fn check_balances_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT user_id, balance, balance_locked
            FROM wallets
            WHERE balance < 0 OR balance_locked < 0 OR balance < balance_locked
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balances_non_negative".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Wallet balance {} / locked {} violates the non-negative invariant",
                    row.balance, row.balance_locked
                ),
                context: serde_json::json!({
                    "balance": row.balance,
                    "balance_locked": row.balance_locked,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: at most one default card per user.
    async fn check_single_default_card(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleDefaultsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS default_count
            FROM payment_methods
            WHERE is_default
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_default_card".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} default payment methods (expected at most 1)",
                    row.default_count
                ),
                context: serde_json::json!({ "default_count": row.default_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: every live payment has a scheduling row, or the
    /// execution scheduler can never pick it up.
    async fn check_payments_have_scheduling(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnscheduledPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.user_id, p.state
            FROM payments p
            WHERE p.state IN ('pending', 'failing')
              AND NOT EXISTS (
                  SELECT 1 FROM payment_scheduling ps WHERE ps.payment_id = p.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payments_have_scheduling".to_string(),
                user_ids: vec![row.user_id],
                description: "Live payment has no scheduling record".to_string(),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "state": row.state,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: the subscription's current period row exists.
    async fn check_current_period_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingPeriodRow> = sqlx::query_as(
            r#"
            SELECT s.id AS subscription_id, s.user_id, s.current_period_index
            FROM subscriptions s
            WHERE s.state <> 'expired'
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_periods sp
                  WHERE sp.subscription_id = s.id
                    AND sp.period_index = s.current_period_index
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "current_period_exists".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription points at period {} but no such row exists",
                    row.current_period_index
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "current_period_index": row.current_period_index,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: settled payments must not leave a pending intent behind.
    async fn check_settled_payments_have_settled_intents(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SettledWithPendingIntentRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.user_id, p.state AS payment_state, pi.id AS intent_id
            FROM payments p
            JOIN payment_intents pi ON pi.id = p.intent_id
            WHERE p.state IN ('success', 'canceled')
              AND pi.state = 'pending'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "settled_payments_have_settled_intents".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment is {} but its intent is still pending",
                    row.payment_state
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "intent_id": row.intent_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: at most one unfinished period per subscription; a new
    /// period is only ever created after the prior reached success.
    async fn check_one_open_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleOpenPeriodsRow> = sqlx::query_as(
            r#"
            SELECT sp.subscription_id, s.user_id, COUNT(*) AS open_count
            FROM subscription_periods sp
            JOIN subscriptions s ON s.id = sp.subscription_id
            WHERE sp.state NOT IN ('success', 'canceled')
            GROUP BY sp.subscription_id, s.user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_open_period".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription has {} unfinished periods (expected at most 1)",
                    row.open_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "open_count": row.open_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "balances_non_negative" => self.check_balances_non_negative().await,
            "single_default_card" => self.check_single_default_card().await,
            "payments_have_scheduling" => self.check_payments_have_scheduling().await,
            "current_period_exists" => self.check_current_period_exists().await,
            "settled_payments_have_settled_intents" => {
                self.check_settled_payments_have_settled_intents().await
            }
            "one_open_period" => self.check_one_open_period().await,
            _ => Ok(vec![]),
        }
    }

    /// Names of all available checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "balances_non_negative",
            "single_default_card",
            "payments_have_scheduling",
            "current_period_exists",
            "settled_payments_have_settled_intents",
            "one_open_period",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn available_checks_cover_all_runners() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"balances_non_negative"));
        assert!(checks.contains(&"one_open_period"));
    }
}
