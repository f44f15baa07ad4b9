//! Gateway charge outcomes

use serde::{Deserialize, Serialize};

/// The four classifications a gateway charge can reach.
///
/// `Success` and `Canceled` are terminal for the underlying intent;
/// `Failing` and `ActionNeeded` leave the payment retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failing,
    ActionNeeded,
    Canceled,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Success => "success",
            PaymentOutcome::Failing => "failing",
            PaymentOutcome::ActionNeeded => "action_needed",
            PaymentOutcome::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for PaymentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
