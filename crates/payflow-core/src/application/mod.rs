//! Application layer: the orchestrator, its hook pipeline, configuration,
//! and crash recovery.

pub mod config;
pub mod hooks;
pub mod orchestrator;
pub mod recovery;

pub use config::{ConfigError, OrchestratorConfig};
pub use hooks::{
    EnrichmentHook, ErrorHandlerHook, EventListenerHook, FraudCheckHook, FraudDecision,
    HookKind, HookRegistry, MetricsHook, PostValidationHook, RoutingOverride,
    RoutingStrategyHook, ValidationHook, MIN_ROUTING_CONFIDENCE,
};
pub use orchestrator::{
    GatewayHealthSummary, HealthSummary, OrchestratorMetrics, OverallHealth, PaymentOrchestrator,
};
pub use recovery::{RecoveryCoordinator, RecoveryReport};

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::error::PaymentError;
use crate::domain::money::{Currency, Money};
use crate::domain::payment::{Customer, Payment, PaymentMethod};

/// A merchant's intent to charge a customer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentCommand {
    /// Owning merchant.
    pub merchant_id: String,
    /// Caller-supplied idempotency key, unique per merchant and operation.
    pub idempotency_key: String,
    /// Charge amount; must be non-negative.
    pub amount: Decimal,
    /// Charge currency.
    pub currency: Currency,
    /// How the customer pays.
    #[serde(rename = "paymentMethod")]
    pub method: PaymentMethod,
    /// The paying customer.
    pub customer: Customer,
    /// Free-form merchant metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CreatePaymentCommand {
    /// Normalize the amount to two decimal places so equal-valued commands
    /// fingerprint identically regardless of textual scale.
    pub fn normalized(mut self) -> Self {
        self.amount = self.amount.round_dp(2).normalize();
        self
    }

    /// Build the `Initiated` payment this command describes, merging in
    /// hook-contributed metadata.
    pub fn into_payment(
        self,
        extra_metadata: HashMap<String, String>,
    ) -> Result<Payment, PaymentError> {
        let amount = Money::new(self.amount, self.currency)?;
        let mut metadata = self.metadata;
        metadata.extend(extra_metadata);
        Ok(Payment::new(
            self.merchant_id,
            self.idempotency_key,
            amount,
            self.method,
            self.customer,
            metadata,
        ))
    }
}
