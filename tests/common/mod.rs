//! Shared fixtures for the integration suite.

#![allow(dead_code)] // each test binary exercises a subset

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use payflow::application::{CreatePaymentCommand, OrchestratorConfig};
use payflow::domain::{Currency, Customer, Money, Payment, PaymentMethod};
use payflow::gateway::{
    GatewayError, GatewayErrorCode, GatewayPaymentStatus, GatewayResponse, GatewayType,
    PaymentGateway,
};
use rust_decimal::Decimal;

/// Scripted fake gateway: pops the next outcome per operation, defaulting
/// to success. `get_status` answers with a fixed reconciliation status.
pub struct ScriptedGateway {
    gateway: GatewayType,
    outcomes: Mutex<HashMap<&'static str, VecDeque<Result<(), GatewayErrorCode>>>>,
    status: GatewayPaymentStatus,
    transaction_id: String,
}

impl ScriptedGateway {
    pub fn succeeding(gateway: GatewayType) -> Self {
        Self {
            gateway,
            outcomes: Mutex::new(HashMap::new()),
            status: GatewayPaymentStatus::Succeeded,
            transaction_id: format!("txn_{gateway}"),
        }
    }

    /// Queue outcomes for one operation; once drained, calls succeed.
    pub fn script(
        self,
        operation: &'static str,
        outcomes: Vec<Result<(), GatewayErrorCode>>,
    ) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(operation, outcomes.into());
        self
    }

    /// Fix the `get_status` reconciliation answer.
    pub fn with_status(mut self, status: GatewayPaymentStatus) -> Self {
        self.status = status;
        self
    }

    fn next(&self, operation: &'static str) -> Result<GatewayResponse, GatewayError> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()));
        match outcome {
            Ok(()) => Ok(GatewayResponse::with_transaction_id(&self.transaction_id)),
            Err(code) => Err(GatewayError::new(code, self.gateway, format!("{code:?}"))),
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn gateway_type(&self) -> GatewayType {
        self.gateway
    }

    async fn initiate(&self, _: &Payment) -> Result<GatewayResponse, GatewayError> {
        self.next("initiate")
    }

    async fn authenticate(&self, _: &Payment) -> Result<GatewayResponse, GatewayError> {
        self.next("authenticate")
    }

    async fn process(&self, _: &Payment) -> Result<GatewayResponse, GatewayError> {
        self.next("process")
    }

    async fn refund(&self, _: &Payment, _: &Money) -> Result<GatewayResponse, GatewayError> {
        self.next("refund")
    }

    async fn get_status(&self, _: &str) -> Result<GatewayPaymentStatus, GatewayError> {
        Ok(self.status.clone())
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// A 100.00 USD card command under the given idempotency key.
pub fn command(key: &str) -> CreatePaymentCommand {
    CreatePaymentCommand {
        merchant_id: "merchant-1".into(),
        idempotency_key: key.into(),
        amount: Decimal::new(10000, 2),
        currency: Currency::USD,
        method: PaymentMethod::Card {
            token: "tok_visa".into(),
            last_four: "4242".into(),
            network: "visa".into(),
        },
        customer: Customer::with_id("cust-1"),
        metadata: HashMap::new(),
    }
}

/// Millisecond-scale timings so the suite runs fast.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::from_toml(
        r#"
        [retry]
        max_retries = 3
        initial_delay_ms = 1
        max_delay_ms = 5
        jitter_factor = 0.0

        [circuit_breaker]
        failure_threshold = 3
        success_threshold = 2
        open_timeout_ms = 50

        [idempotency]
        poll_interval_ms = 5
        lock_timeout_ms = 1000

        [optimistic_lock]
        initial_backoff_ms = 1
        "#,
    )
    .unwrap()
}
