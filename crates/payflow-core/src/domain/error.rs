//! The error taxonomy shared across the orchestration core.
//!
//! Components fail with their own narrow error types; everything converges
//! into [`PaymentError`] at the application boundary so callers see one
//! closed taxonomy and no naked strings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lifecycle::PaymentState;
use super::money::MoneyError;
use crate::gateway::{GatewayError, GatewayErrorCode, GatewayType};

/// Top-level error taxonomy of the orchestration core.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PaymentError {
    /// Command or hook validation failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An idempotency key was reused with a different request body.
    #[error("idempotency key reused with a different request body: {scoped_key}")]
    FingerprintMismatch {
        /// The scoped key the fingerprint was checked under.
        scoped_key: String,
    },

    /// A lock could not be acquired, or an in-flight record never settled.
    #[error("timed out waiting on '{name}'")]
    LockTimeout {
        /// Lock or record name.
        name: String,
    },

    /// A versioned write lost the compare-and-swap race.
    #[error("optimistic lock conflict on {id}: expected stored version {expected}, found {found}")]
    OptimisticLockConflict {
        /// Aggregate id.
        id: String,
        /// Stored version the write expected.
        expected: u64,
        /// Stored version actually found.
        found: u64,
    },

    /// A lifecycle transition not present in the transition table.
    #[error("invalid payment transition {from} -> {to}")]
    InvalidTransition {
        /// State transitioned from.
        from: PaymentState,
        /// State transitioned to.
        to: PaymentState,
    },

    /// A gateway call failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The gateway's circuit breaker is open.
    #[error("circuit open for gateway '{gateway}', retry after {retry_after:?}")]
    CircuitOpen {
        /// Gateway whose circuit is open.
        gateway: String,
        /// Time until the circuit may admit probes again.
        retry_after: Duration,
    },

    /// An event append targeted the wrong next version.
    #[error("event version mismatch on {aggregate_id}: expected {expected}, got {got}")]
    EventVersionMismatch {
        /// Aggregate id.
        aggregate_id: String,
        /// Expected next version.
        expected: u64,
        /// Version that was offered.
        got: u64,
    },

    /// A stored event stream is not contiguous from version 1.
    #[error("event stream discontinuity on {aggregate_id}: {detail}")]
    EventContinuity {
        /// Aggregate id.
        aggregate_id: String,
        /// What broke.
        detail: String,
    },

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Stable machine-readable kind, used when caching failed outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::Validation(_) => "validation",
            PaymentError::FingerprintMismatch { .. } => "fingerprint_mismatch",
            PaymentError::LockTimeout { .. } => "lock_timeout",
            PaymentError::OptimisticLockConflict { .. } => "optimistic_lock_conflict",
            PaymentError::InvalidTransition { .. } => "invalid_transition",
            PaymentError::Gateway(_) => "gateway",
            PaymentError::CircuitOpen { .. } => "circuit_open",
            PaymentError::EventVersionMismatch { .. } => "event_version_mismatch",
            PaymentError::EventContinuity { .. } => "event_continuity",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::Internal(_) => "internal",
        }
    }

    /// Whether a retry of the failed operation could change the outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Gateway(e) => e.retryable,
            _ => false,
        }
    }

    /// Serializable record of this error for the idempotency cache.
    pub fn to_record(&self) -> ErrorRecord {
        let (code, gateway, retryable) = match self {
            PaymentError::Gateway(e) => (Some(e.code), Some(e.gateway), Some(e.retryable)),
            _ => (None, None, None),
        };
        ErrorRecord {
            kind: self.kind().to_string(),
            message: self.to_string(),
            code,
            gateway,
            retryable,
        }
    }

    /// Rehydrate a cached failure. Gateway errors keep their code and
    /// retryability; other kinds come back as the closest taxonomy member.
    pub fn from_record(record: ErrorRecord) -> PaymentError {
        if let (Some(code), Some(gateway)) = (record.code, record.gateway) {
            let mut error = GatewayError::new(code, gateway, record.message);
            if let Some(retryable) = record.retryable {
                error.retryable = retryable;
            }
            return PaymentError::Gateway(error);
        }
        match record.kind.as_str() {
            "validation" => PaymentError::Validation(record.message),
            "not_found" => PaymentError::NotFound(record.message),
            _ => PaymentError::Internal(record.message),
        }
    }
}

impl From<MoneyError> for PaymentError {
    fn from(error: MoneyError) -> Self {
        PaymentError::Validation(error.to_string())
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(error: serde_json::Error) -> Self {
        PaymentError::Internal(format!("serialization: {error}"))
    }
}

/// Serializable snapshot of a [`PaymentError`] for the idempotency cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable error kind.
    pub kind: String,
    /// Rendered message.
    pub message: String,
    /// Gateway error code, when the failure came from a gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<GatewayErrorCode>,
    /// Originating gateway, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayType>,
    /// Whether the gateway failure was retryable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}
