//! The authoritative payment lifecycle state machine.
//!
//! Every persisted transition must appear in [`TRANSITIONS`]; anything else
//! is rejected with [`PaymentError::InvalidTransition`]. `Success` and
//! `Failure` are terminal and never leave their state.

use serde::{Deserialize, Serialize};

use super::error::PaymentError;

/// Lifecycle states of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    /// Created and admitted, no gateway contact yet.
    Initiated,
    /// Customer authentication completed with a selected gateway.
    Authenticated,
    /// The gateway accepted the charge and issued a transaction id.
    Processing,
    /// The charge completed.
    Success,
    /// The charge terminally failed.
    Failure,
}

impl PaymentState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Success | PaymentState::Failure)
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PaymentState::Initiated => "INITIATED",
            PaymentState::Authenticated => "AUTHENTICATED",
            PaymentState::Processing => "PROCESSING",
            PaymentState::Success => "SUCCESS",
            PaymentState::Failure => "FAILURE",
        };
        write!(f, "{}", name)
    }
}

/// The complete transition table. Order: (from, to).
pub const TRANSITIONS: &[(PaymentState, PaymentState)] = &[
    (PaymentState::Initiated, PaymentState::Authenticated),
    (PaymentState::Authenticated, PaymentState::Processing),
    (PaymentState::Processing, PaymentState::Success),
    (PaymentState::Initiated, PaymentState::Failure),
    (PaymentState::Authenticated, PaymentState::Failure),
    (PaymentState::Processing, PaymentState::Failure),
];

/// Whether `from -> to` appears in the transition table.
pub fn is_valid_transition(from: PaymentState, to: PaymentState) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// Guard a transition, failing with `InvalidTransition` when not tabled.
pub fn ensure_transition(from: PaymentState, to: PaymentState) -> Result<(), PaymentError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(PaymentError::InvalidTransition { from, to })
    }
}
