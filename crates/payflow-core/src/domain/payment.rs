//! The immutable `Payment` aggregate.
//!
//! A `Payment` is a value: every mutator consumes the current value and
//! returns a new one with `updated_at` advanced and `version` incremented.
//! Transitions are guarded by the lifecycle table so an invalid mutation can
//! never be constructed, only rejected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::PaymentError;
use super::lifecycle::{ensure_transition, PaymentState};
use super::money::Money;
use crate::gateway::GatewayType;

/// Payment identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub Uuid);

impl PaymentId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PaymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PaymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the customer pays, with per-variant details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Card payment (credit or debit). Carries a vaulted token, never a PAN.
    Card {
        /// Vault token referencing the stored card.
        token: String,
        /// Last four digits for display.
        last_four: String,
        /// Card network (visa, mastercard, ...).
        network: String,
    },
    /// UPI collect/intent payment.
    Upi {
        /// Virtual payment address.
        vpa: String,
    },
    /// Net-banking redirect.
    NetBanking {
        /// Bank identifier code.
        bank_code: String,
    },
    /// Hosted wallet.
    Wallet {
        /// Wallet provider name.
        provider: String,
    },
    /// Buy-now-pay-later provider.
    PayLater {
        /// BNPL provider name.
        provider: String,
    },
}

impl PaymentMethod {
    /// Stable lowercase label for logs and routing rules.
    pub fn label(&self) -> &'static str {
        match self {
            PaymentMethod::Card { .. } => "card",
            PaymentMethod::Upi { .. } => "upi",
            PaymentMethod::NetBanking { .. } => "net_banking",
            PaymentMethod::Wallet { .. } => "wallet",
            PaymentMethod::PayLater { .. } => "pay_later",
        }
    }
}

/// The paying customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    /// Merchant-scoped customer identifier.
    pub id: String,
    /// Contact email, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Customer {
    /// Customer with only an id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
        }
    }
}

/// The payment aggregate.
///
/// Invariants upheld by construction:
/// - state transitions follow the lifecycle table;
/// - `gateway_type` is set from `Authenticated` onward;
/// - `gateway_transaction_id` is set from `Processing` onward;
/// - `failure_reason` is set exactly when the state is `Failure`;
/// - `version` increases by one per mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    id: PaymentId,
    merchant_id: String,
    idempotency_key: String,
    state: PaymentState,
    amount: Money,
    method: PaymentMethod,
    customer: Customer,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway_type: Option<GatewayType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway_transaction_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    retry_count: u32,
    version: u64,
}

impl Payment {
    /// Construct a freshly admitted payment in `Initiated` at version 1.
    pub fn new(
        merchant_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        amount: Money,
        method: PaymentMethod,
        customer: Customer,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PaymentId::new(),
            merchant_id: merchant_id.into(),
            idempotency_key: idempotency_key.into(),
            state: PaymentState::Initiated,
            amount,
            method,
            customer,
            metadata,
            gateway_type: None,
            gateway_transaction_id: None,
            created_at: now,
            updated_at: now,
            failure_reason: None,
            retry_count: 0,
            version: 1,
        }
    }

    /// Construct a retry attempt of a failed payment: a new aggregate (new
    /// id, fresh stream) carrying the same commercial intent with
    /// `retry_count` advanced.
    pub fn retry_of(previous: &Payment) -> Self {
        let mut next = Payment::new(
            previous.merchant_id.clone(),
            previous.idempotency_key.clone(),
            previous.amount,
            previous.method.clone(),
            previous.customer.clone(),
            previous.metadata.clone(),
        );
        next.retry_count = previous.retry_count + 1;
        next
    }

    /// Aggregate id.
    pub fn id(&self) -> PaymentId {
        self.id
    }

    /// Owning merchant.
    pub fn merchant_id(&self) -> &str {
        &self.merchant_id
    }

    /// Caller-supplied idempotency key.
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PaymentState {
        self.state
    }

    /// Charge amount.
    pub fn amount(&self) -> &Money {
        &self.amount
    }

    /// Payment method.
    pub fn method(&self) -> &PaymentMethod {
        &self.method
    }

    /// Paying customer.
    pub fn customer(&self) -> &Customer {
        &self.customer
    }

    /// Free-form merchant metadata.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Selected gateway, set from `Authenticated` onward.
    pub fn gateway_type(&self) -> Option<GatewayType> {
        self.gateway_type
    }

    /// Gateway-issued transaction id, set from `Processing` onward.
    pub fn gateway_transaction_id(&self) -> Option<&str> {
        self.gateway_transaction_id.as_deref()
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp of the latest mutation.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Failure reason, set exactly when the state is `Failure`.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// How many retry attempts preceded this payment.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Optimistic-lock version, starting at 1.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether another retry attempt is allowed under the given cap.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// `Initiated -> Authenticated`, binding the selected gateway.
    pub fn authenticate(self, gateway: GatewayType) -> Result<Payment, PaymentError> {
        ensure_transition(self.state, PaymentState::Authenticated)?;
        Ok(self.advance(PaymentState::Authenticated, |p| {
            p.gateway_type = Some(gateway);
        }))
    }

    /// `Authenticated -> Processing`, capturing the gateway transaction id.
    pub fn start_processing(
        self,
        gateway_transaction_id: impl Into<String>,
    ) -> Result<Payment, PaymentError> {
        ensure_transition(self.state, PaymentState::Processing)?;
        let id = gateway_transaction_id.into();
        Ok(self.advance(PaymentState::Processing, |p| {
            p.gateway_transaction_id = Some(id);
        }))
    }

    /// `Processing -> Success`.
    pub fn mark_success(self) -> Result<Payment, PaymentError> {
        ensure_transition(self.state, PaymentState::Success)?;
        Ok(self.advance(PaymentState::Success, |_| {}))
    }

    /// Any non-terminal state `-> Failure`, recording the reason.
    pub fn mark_failure(self, reason: impl Into<String>) -> Result<Payment, PaymentError> {
        ensure_transition(self.state, PaymentState::Failure)?;
        let reason = reason.into();
        Ok(self.advance(PaymentState::Failure, |p| {
            p.failure_reason = Some(reason);
        }))
    }

    /// Record a retry attempt on the stream without changing state.
    pub fn record_retry_attempt(self, attempt: u32) -> Payment {
        let mut next = self;
        next.retry_count = attempt;
        next.updated_at = Utc::now();
        next.version += 1;
        next
    }

    fn advance(self, state: PaymentState, apply: impl FnOnce(&mut Payment)) -> Payment {
        let mut next = self;
        next.state = state;
        next.updated_at = Utc::now();
        next.version += 1;
        apply(&mut next);
        next
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::money::Currency;

    fn sample_payment() -> Payment {
        Payment::new(
            "merchant-1",
            "key-1",
            Money::new(Decimal::new(10000, 2), Currency::USD).unwrap(),
            PaymentMethod::Card {
                token: "tok_abc".into(),
                last_four: "4242".into(),
                network: "visa".into(),
            },
            Customer::with_id("cust-1"),
            HashMap::new(),
        )
    }

    #[test]
    fn test_new_payment_starts_initiated_at_version_one() {
        let payment = sample_payment();
        assert_eq!(payment.state(), PaymentState::Initiated);
        assert_eq!(payment.version(), 1);
        assert_eq!(payment.retry_count(), 0);
        assert!(payment.gateway_type().is_none());
        assert!(payment.gateway_transaction_id().is_none());
        assert!(payment.failure_reason().is_none());
    }

    #[test]
    fn test_full_lifecycle_advances_versions() {
        let payment = sample_payment()
            .authenticate(GatewayType::Stripe)
            .unwrap()
            .start_processing("txn_1")
            .unwrap()
            .mark_success()
            .unwrap();

        assert_eq!(payment.state(), PaymentState::Success);
        assert_eq!(payment.version(), 4);
        assert_eq!(payment.gateway_type(), Some(GatewayType::Stripe));
        assert_eq!(payment.gateway_transaction_id(), Some("txn_1"));
    }

    #[test]
    fn test_mutators_return_new_values() {
        let original = sample_payment();
        let authenticated = original.clone().authenticate(GatewayType::Stripe).unwrap();

        assert_eq!(original.state(), PaymentState::Initiated);
        assert_eq!(authenticated.state(), PaymentState::Authenticated);
        assert_eq!(original.version() + 1, authenticated.version());
    }

    #[test]
    fn test_failure_records_reason() {
        let payment = sample_payment().mark_failure("card declined").unwrap();
        assert_eq!(payment.state(), PaymentState::Failure);
        assert_eq!(payment.failure_reason(), Some("card declined"));
    }

    #[test]
    fn test_terminal_payment_rejects_mutation() {
        let payment = sample_payment().mark_failure("declined").unwrap();
        let err = payment.authenticate(GatewayType::Stripe).unwrap_err();
        assert!(matches!(err, PaymentError::InvalidTransition { .. }));
    }

    #[test]
    fn test_skipping_authentication_is_rejected() {
        let err = sample_payment().start_processing("txn_1").unwrap_err();
        assert!(matches!(err, PaymentError::InvalidTransition { .. }));
    }

    #[test]
    fn test_retry_of_creates_fresh_aggregate() {
        let failed = sample_payment().mark_failure("timeout").unwrap();
        let retry = Payment::retry_of(&failed);

        assert_ne!(retry.id(), failed.id());
        assert_eq!(retry.state(), PaymentState::Initiated);
        assert_eq!(retry.version(), 1);
        assert_eq!(retry.retry_count(), 1);
        assert_eq!(retry.idempotency_key(), failed.idempotency_key());
        assert!(retry.failure_reason().is_none());
    }

    #[test]
    fn test_can_retry_respects_cap() {
        let payment = sample_payment();
        assert!(payment.can_retry(1));
        let retried = Payment::retry_of(&payment);
        assert!(!retried.can_retry(1));
        assert!(retried.can_retry(3));
    }

    #[test]
    fn test_payment_json_round_trip_is_identity() {
        let payment = sample_payment()
            .authenticate(GatewayType::Paypal)
            .unwrap()
            .start_processing("txn_9")
            .unwrap();

        let json = serde_json::to_string(&payment).unwrap();
        let back: Payment = serde_json::from_str(&json).unwrap();
        assert_eq!(payment, back);
    }
}
