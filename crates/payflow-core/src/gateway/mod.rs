//! The uniform contract over external payment processors.
//!
//! Concrete adapters (Stripe, PayPal, ...) live outside this crate; the
//! orchestrator only ever sees [`PaymentGateway`] plus the error and status
//! vocabulary defined here.

mod metrics;

pub use metrics::{GatewayMetrics, MetricsCollector, MetricsRegistry};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain::money::Money;
use crate::domain::payment::Payment;

/// Known gateway kinds the router can select between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    /// Stripe.
    Stripe,
    /// PayPal.
    Paypal,
    /// Razorpay.
    Razorpay,
    /// Adyen.
    Adyen,
    /// Braintree.
    Braintree,
}

impl GatewayType {
    /// Stable lowercase name, also the deterministic tie-break key.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayType::Stripe => "stripe",
            GatewayType::Paypal => "paypal",
            GatewayType::Razorpay => "razorpay",
            GatewayType::Adyen => "adyen",
            GatewayType::Braintree => "braintree",
        }
    }
}

impl std::fmt::Display for GatewayType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Error codes a gateway call can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Connection-level failure before a response.
    NetworkError,
    /// The call exceeded its deadline.
    Timeout,
    /// Gateway rejected our credentials.
    AuthFailed,
    /// The customer lacks funds.
    InsufficientFunds,
    /// The instrument is malformed or unusable.
    InvalidCard,
    /// The issuer declined the charge.
    CardDeclined,
    /// The gateway's fraud screen rejected the charge.
    FraudDetected,
    /// Generic gateway-side failure.
    GatewayError,
    /// The request was malformed.
    InvalidRequest,
    /// The gateway throttled us.
    RateLimitExceeded,
    /// Anything unclassified.
    Unknown,
}

impl GatewayErrorCode {
    /// Domain-driven retryability: transport and throttling failures are
    /// retryable, issuer and instrument verdicts are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayErrorCode::NetworkError
            | GatewayErrorCode::Timeout
            | GatewayErrorCode::RateLimitExceeded
            | GatewayErrorCode::GatewayError => true,
            GatewayErrorCode::AuthFailed
            | GatewayErrorCode::InsufficientFunds
            | GatewayErrorCode::InvalidCard
            | GatewayErrorCode::CardDeclined
            | GatewayErrorCode::FraudDetected
            | GatewayErrorCode::InvalidRequest
            | GatewayErrorCode::Unknown => false,
        }
    }
}

/// A failure reported by (or on behalf of) a gateway.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("[{gateway}] {code:?}: {message}")]
pub struct GatewayError {
    /// Classified error code.
    pub code: GatewayErrorCode,
    /// Human-readable message.
    pub message: String,
    /// The gateway that produced (or timed out on) the call.
    pub gateway: GatewayType,
    /// Whether retrying the same call may succeed.
    pub retryable: bool,
}

impl GatewayError {
    /// Build an error with retryability derived from the code.
    pub fn new(code: GatewayErrorCode, gateway: GatewayType, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            gateway,
            retryable: code.is_retryable(),
        }
    }

    /// A deadline-expiry error recorded on the caller's side.
    pub fn timeout(gateway: GatewayType, elapsed: Duration) -> Self {
        Self::new(
            GatewayErrorCode::Timeout,
            gateway,
            format!("call exceeded deadline after {elapsed:?}"),
        )
    }
}

/// Gateway-reported status of a transaction, used for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentStatus {
    /// The gateway has not finished the charge.
    Pending,
    /// The charge completed.
    Succeeded,
    /// The charge failed.
    Failed,
}

/// Successful response from a gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    /// Gateway-issued transaction id.
    pub gateway_transaction_id: String,
    /// Processor-specific fields worth keeping.
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl GatewayResponse {
    /// Response carrying only a transaction id.
    pub fn with_transaction_id(id: impl Into<String>) -> Self {
        Self {
            gateway_transaction_id: id.into(),
            details: HashMap::new(),
        }
    }
}

/// The port every processor adapter implements.
///
/// All methods are total: a processor outcome is either a response or a
/// classified [`GatewayError`], never a panic or an untyped failure.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Which gateway this adapter talks to.
    fn gateway_type(&self) -> GatewayType;

    /// Create the charge on the processor side.
    async fn initiate(&self, payment: &Payment) -> Result<GatewayResponse, GatewayError>;

    /// Run customer authentication (3DS and friends).
    async fn authenticate(&self, payment: &Payment) -> Result<GatewayResponse, GatewayError>;

    /// Capture the charge.
    async fn process(&self, payment: &Payment) -> Result<GatewayResponse, GatewayError>;

    /// Refund a completed charge (full or partial).
    async fn refund(
        &self,
        payment: &Payment,
        amount: &Money,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Query the processor's view of a transaction.
    async fn get_status(
        &self,
        gateway_transaction_id: &str,
    ) -> Result<GatewayPaymentStatus, GatewayError>;

    /// Liveness probe.
    async fn health_check(&self) -> Result<(), GatewayError>;
}

/// Connection options for a registered gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// API key.
    pub api_key: String,
    /// API secret, when the processor uses key pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Webhook signing secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Override the processor base URL (sandbox, regional endpoints).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-call deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Per-gateway retry budget override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    /// Processor-specific extras.
    #[serde(default)]
    pub additional_config: HashMap<String, String>,
}

impl GatewayConfig {
    /// Minimal config with just an API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: None,
            webhook_secret: None,
            base_url: None,
            timeout_ms: None,
            retry_attempts: None,
            additional_config: HashMap::new(),
        }
    }

    /// The per-call deadline, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A gateway adapter together with its connection options.
#[derive(Clone)]
pub struct RegisteredGateway {
    /// The adapter.
    pub gateway: Arc<dyn PaymentGateway>,
    /// Its options.
    pub config: GatewayConfig,
}

/// Per-orchestrator registry of gateway adapters. Not a process-wide
/// singleton: tests spin up isolated registries.
#[derive(Default)]
pub struct GatewayRegistry {
    gateways: DashMap<GatewayType, RegisteredGateway>,
}

impl GatewayRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an adapter.
    pub fn register(
        &self,
        gateway_type: GatewayType,
        config: GatewayConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) {
        self.gateways
            .insert(gateway_type, RegisteredGateway { gateway, config });
    }

    /// Look up an adapter.
    pub fn get(&self, gateway_type: GatewayType) -> Option<RegisteredGateway> {
        self.gateways.get(&gateway_type).map(|r| r.clone())
    }

    /// All registered gateway types, sorted by name for determinism.
    pub fn types(&self) -> Vec<GatewayType> {
        let mut types: Vec<GatewayType> = self.gateways.iter().map(|e| *e.key()).collect();
        types.sort_by_key(|g| g.name());
        types
    }

    /// Number of registered gateways.
    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    /// Whether no gateways are registered.
    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}
