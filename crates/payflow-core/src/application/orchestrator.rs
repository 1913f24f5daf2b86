//! The payment orchestrator.
//!
//! Composes idempotent admission, hook filtering, gateway routing, the
//! breaker-inside-retry call path, lifecycle transitions, versioned
//! persistence, and the event log. Every state change is persisted with a
//! compare-and-swap and appended to the stream before the outcome is
//! reported, so crash recovery can always reconcile.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::domain::error::PaymentError;
use crate::domain::events::PaymentEvent;
use crate::domain::lifecycle::PaymentState;
use crate::domain::money::Money;
use crate::domain::payment::{Payment, PaymentId};
use crate::eventstore::{EventStore, InMemoryEventStore};
use crate::gateway::{
    GatewayConfig, GatewayError, GatewayMetrics, GatewayRegistry, GatewayResponse, GatewayType,
    MetricsRegistry, PaymentGateway,
};
use crate::idempotency::{
    IdempotencyEngine, IdempotencyScope, IdempotencyStore, InMemoryIdempotencyStore,
};
use crate::lock::{InMemoryLockManager, LockManager};
use crate::repository::{
    InMemoryPaymentRepository, VersionedPaymentService, VersionedRepository,
};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitHealth, CircuitState, JitterSource, RetryExecutor,
    ThreadRngJitter,
};
use crate::routing::{RoutingEngine, RoutingError};

use super::hooks::HookRegistry;
use super::recovery::{RecoveryCoordinator, RecoveryReport};
use super::{CreatePaymentCommand, OrchestratorConfig};

/// Deadline for gateway calls without a per-gateway override.
const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Key in `GatewayConfig::additional_config` carrying the per-transaction
/// cost used by routing.
const COST_CONFIG_KEY: &str = "cost_per_transaction";

#[derive(Default)]
struct StatsCounters {
    payments_created: AtomicU64,
    payments_succeeded: AtomicU64,
    payments_failed: AtomicU64,
    gateway_retries: AtomicU64,
    circuit_open_rejections: AtomicU64,
    recovered_payments: AtomicU64,
}

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorMetrics {
    /// Payments admitted (retries included).
    pub payments_created: u64,
    /// Payments that reached SUCCESS.
    pub payments_succeeded: u64,
    /// Payments that reached FAILURE.
    pub payments_failed: u64,
    /// Extra gateway attempts made by the retry policy.
    pub gateway_retries: u64,
    /// Calls rejected by an open circuit.
    pub circuit_open_rejections: u64,
    /// Payments driven terminal by crash recovery.
    pub recovered_payments: u64,
}

/// Coarse service health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallHealth {
    /// All circuits closed and healthy.
    Healthy,
    /// Some gateway is open or degraded.
    Degraded,
    /// Every registered gateway's circuit is open.
    Unhealthy,
}

/// One gateway's health line in the summary.
#[derive(Debug, Clone)]
pub struct GatewayHealthSummary {
    /// The gateway.
    pub gateway: GatewayType,
    /// Its circuit health snapshot.
    pub circuit: CircuitHealth,
}

/// Orchestrator-wide health snapshot.
#[derive(Debug, Clone)]
pub struct HealthSummary {
    /// Coarse classification.
    pub overall: OverallHealth,
    /// Per-gateway detail, sorted by gateway name.
    pub gateways: Vec<GatewayHealthSummary>,
}

/// The orchestration core. One instance per deployment unit; tests spin up
/// isolated instances with in-memory ports.
pub struct PaymentOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn IdempotencyStore>,
    locks: Arc<dyn LockManager>,
    repository: Arc<dyn VersionedRepository<Payment>>,
    events: Arc<dyn EventStore>,
    jitter: Arc<dyn JitterSource>,
    idempotency: IdempotencyEngine,
    payments: VersionedPaymentService,
    retry: RetryExecutor,
    routing: RoutingEngine,
    gateways: Arc<GatewayRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
    hooks: Arc<HookRegistry>,
    stats: StatsCounters,
}

impl PaymentOrchestrator {
    /// Orchestrator over in-memory ports.
    pub fn new(config: OrchestratorConfig) -> Self {
        let store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
        let locks: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new());
        let repository: Arc<dyn VersionedRepository<Payment>> =
            Arc::new(InMemoryPaymentRepository::new());
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let jitter: Arc<dyn JitterSource> = Arc::new(ThreadRngJitter);

        let idempotency = IdempotencyEngine::new(
            store.clone(),
            locks.clone(),
            config.idempotency.to_engine_config(),
        );
        let payments = VersionedPaymentService::with_jitter(
            repository.clone(),
            config.optimistic_lock.to_lock_config(),
            jitter.clone(),
        );
        let retry =
            RetryExecutor::with_jitter(config.retry.to_retry_config(), jitter.clone());
        let routing = config.routing.to_engine();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.to_breaker_config(),
        ));

        Self {
            config,
            store,
            locks,
            repository,
            events,
            jitter,
            idempotency,
            payments,
            retry,
            routing,
            gateways: Arc::new(GatewayRegistry::new()),
            breakers,
            metrics: Arc::new(MetricsRegistry::new()),
            hooks: Arc::new(HookRegistry::new()),
            stats: StatsCounters::default(),
        }
    }

    fn rebuild(mut self) -> Self {
        self.idempotency = IdempotencyEngine::new(
            self.store.clone(),
            self.locks.clone(),
            self.config.idempotency.to_engine_config(),
        );
        self.payments = VersionedPaymentService::with_jitter(
            self.repository.clone(),
            self.config.optimistic_lock.to_lock_config(),
            self.jitter.clone(),
        );
        self.retry =
            RetryExecutor::with_jitter(self.config.retry.to_retry_config(), self.jitter.clone());
        self.routing = self.config.routing.to_engine();
        self
    }

    /// Swap the idempotency store (e.g. for a durable backend).
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = store;
        self.rebuild()
    }

    /// Swap the lock manager.
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self.rebuild()
    }

    /// Swap the payment repository.
    pub fn with_repository(mut self, repository: Arc<dyn VersionedRepository<Payment>>) -> Self {
        self.repository = repository;
        self.rebuild()
    }

    /// Swap the event store.
    pub fn with_event_store(mut self, events: Arc<dyn EventStore>) -> Self {
        self.events = events;
        self.rebuild()
    }

    /// Swap the jitter source (deterministic tests).
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self.rebuild()
    }

    /// The hook registry for this orchestrator.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// The configuration in effect.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a gateway adapter with its connection options, creating its
    /// circuit breaker and metrics collector.
    pub fn register_gateway(
        &self,
        gateway_type: GatewayType,
        config: GatewayConfig,
        adapter: Arc<dyn PaymentGateway>,
    ) {
        let cost = config
            .additional_config
            .get(COST_CONFIG_KEY)
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);
        self.breakers.get_or_create(gateway_type);
        self.metrics.get_or_create(gateway_type, cost);
        self.gateways.register(gateway_type, config, adapter);
        tracing::info!(gateway = %gateway_type, "gateway registered");
    }

    /// Admit a charge idempotently and persist it in `Initiated`.
    pub async fn create_payment(
        &self,
        command: CreatePaymentCommand,
    ) -> Result<Payment, PaymentError> {
        let command = command.normalized();
        let scope = IdempotencyScope::new(
            &command.merchant_id,
            "create_payment",
            &command.idempotency_key,
        );
        let body = serde_json::to_value(&command)?;

        self.idempotency
            .execute(&scope, &body, || self.admit(command))
            .await
    }

    async fn admit(&self, command: CreatePaymentCommand) -> Result<Payment, PaymentError> {
        self.hooks.run_pre_validation(&command).await?;
        let enriched = self.hooks.run_enrichment(&command).await;
        let payment = command.into_payment(enriched)?;
        self.hooks.run_post_validation(&payment).await;

        self.repository.insert(payment.clone()).await?;
        self.append_and_notify(PaymentEvent::initiated(&payment)).await?;
        self.stats.payments_created.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            payment_id = %payment.id(),
            merchant_id = payment.merchant_id(),
            amount = %payment.amount(),
            "payment admitted"
        );
        Ok(payment)
    }

    /// Drive a payment through authenticate -> initiate -> process.
    ///
    /// Terminal business outcomes persist as state: a denied or declined
    /// charge transitions to `Failure` (fraud denials return the failed
    /// payment; gateway failures additionally re-raise the gateway error).
    /// An open circuit with no alternate gateway fast-fails with
    /// [`PaymentError::CircuitOpen`] and leaves the payment non-terminal.
    pub async fn process_payment(&self, id: &PaymentId) -> Result<Payment, PaymentError> {
        let payment = self.get_payment(id).await?;
        if payment.state().is_terminal() {
            return Ok(payment);
        }

        if payment.state() == PaymentState::Initiated {
            if let Err(reason) = self.hooks.run_fraud_checks(&payment).await {
                let error = PaymentError::Validation(format!("fraud check denied: {reason}"));
                self.hooks.notify_error(Some(payment.id()), &error).await;
                return self.fail(payment, format!("fraud check denied: {reason}")).await;
            }
        }

        let mut current = payment;
        if current.state() == PaymentState::Initiated {
            current = self.step_authenticate(current).await?;
            if current.state().is_terminal() {
                return Ok(current);
            }
        }
        if current.state() == PaymentState::Authenticated {
            current = self.step_initiate(current).await?;
            if current.state().is_terminal() {
                return Ok(current);
            }
        }
        if current.state() == PaymentState::Processing {
            current = self.step_process(current).await?;
        }
        Ok(current)
    }

    /// Fetch a payment.
    pub async fn get_payment(&self, id: &PaymentId) -> Result<Payment, PaymentError> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))
    }

    /// Every payment belonging to a customer, oldest first.
    pub async fn get_customer_payments(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Payment>, PaymentError> {
        Ok(self
            .repository
            .find_all()
            .await?
            .into_iter()
            .filter(|p| p.customer().id == customer_id)
            .collect())
    }

    /// Counter snapshot.
    pub fn get_metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            payments_created: self.stats.payments_created.load(Ordering::Relaxed),
            payments_succeeded: self.stats.payments_succeeded.load(Ordering::Relaxed),
            payments_failed: self.stats.payments_failed.load(Ordering::Relaxed),
            gateway_retries: self.stats.gateway_retries.load(Ordering::Relaxed),
            circuit_open_rejections: self.stats.circuit_open_rejections.load(Ordering::Relaxed),
            recovered_payments: self.stats.recovered_payments.load(Ordering::Relaxed),
        }
    }

    /// Per-gateway circuit health with a coarse overall classification.
    pub fn get_health_summary(&self) -> HealthSummary {
        let gateways: Vec<GatewayHealthSummary> = self
            .breakers
            .all_health()
            .into_iter()
            .map(|(gateway, circuit)| GatewayHealthSummary { gateway, circuit })
            .collect();

        let overall = if gateways.is_empty() {
            OverallHealth::Healthy
        } else if gateways
            .iter()
            .all(|g| g.circuit.state == CircuitState::Open)
        {
            OverallHealth::Unhealthy
        } else if gateways.iter().any(|g| {
            g.circuit.state != CircuitState::Closed || g.circuit.health_score < 0.5
        }) {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        HealthSummary { overall, gateways }
    }

    /// Rolling metrics for every registered gateway.
    pub fn get_gateway_metrics(&self) -> Vec<GatewayMetrics> {
        self.metrics.snapshot_all()
    }

    /// Sweep expired idempotency records.
    pub async fn cleanup_idempotency(&self) -> Result<usize, PaymentError> {
        self.idempotency.cleanup().await
    }

    /// Refund a successful payment (full refund when `amount` is `None`).
    /// Refunds do not re-enter the lifecycle; the gateway response is
    /// returned as-is.
    pub async fn refund_payment(
        &self,
        id: &PaymentId,
        amount: Option<Money>,
    ) -> Result<GatewayResponse, PaymentError> {
        let payment = self.get_payment(id).await?;
        if payment.state() != PaymentState::Success {
            return Err(PaymentError::Validation(format!(
                "only successful payments can be refunded (state is {})",
                payment.state()
            )));
        }
        let refund_amount = amount.unwrap_or(*payment.amount());
        // Validates currency match and refund <= captured amount.
        payment.amount().subtract(&refund_amount)?;

        let gateway_type = payment.gateway_type().ok_or_else(|| {
            PaymentError::Internal("successful payment without a gateway".to_string())
        })?;

        let subject = payment.clone();
        self.call_gateway(gateway_type, "refund", move |adapter| {
            let payment = subject.clone();
            let amount = refund_amount;
            async move { adapter.refund(&payment, &amount).await }
        })
        .await
    }

    /// Admit a fresh attempt for a failed payment under a per-attempt
    /// operation scope. The caller's idempotency key is shared with the
    /// original only through that scoping.
    pub async fn retry_payment(&self, id: &PaymentId) -> Result<Payment, PaymentError> {
        let failed = self.get_payment(id).await?;
        if failed.state() != PaymentState::Failure {
            return Err(PaymentError::Validation(format!(
                "only failed payments can be retried (state is {})",
                failed.state()
            )));
        }
        if !failed.can_retry(self.config.retry.max_retries) {
            return Err(PaymentError::Validation(format!(
                "retry budget exhausted after {} attempts",
                failed.retry_count()
            )));
        }

        let attempt = failed.retry_count() + 1;
        let scope = IdempotencyScope::new(
            failed.merchant_id(),
            format!("retry_payment#{attempt}"),
            failed.idempotency_key(),
        );
        let body = json!({ "paymentId": id.to_string(), "attempt": attempt });

        self.idempotency
            .execute(&scope, &body, || async {
                let fresh = Payment::retry_of(&failed);
                let initiated = PaymentEvent::initiated(&fresh);
                let marked = fresh.record_retry_attempt(attempt);
                let retry_marker = PaymentEvent::retry_attempted(&marked);

                self.repository.insert(marked.clone()).await?;
                self.events
                    .append(vec![initiated.clone(), retry_marker.clone()])
                    .await?;
                self.hooks.notify_event_listeners(&initiated).await;
                self.hooks.notify_event_listeners(&retry_marker).await;
                self.stats.payments_created.fetch_add(1, Ordering::Relaxed);

                tracing::info!(
                    original = %failed.id(),
                    retry = %marked.id(),
                    attempt,
                    "retry attempt admitted"
                );
                Ok(marked)
            })
            .await
    }

    /// Run a crash-recovery sweep over non-terminal streams.
    pub async fn recover(&self) -> Result<RecoveryReport, PaymentError> {
        let coordinator = RecoveryCoordinator::new(
            self.events.clone(),
            self.repository.clone(),
            self.gateways.clone(),
        );
        let report = coordinator.recover().await?;

        self.stats
            .recovered_payments
            .fetch_add((report.recovered_success + report.recovered_failure) as u64, Ordering::Relaxed);
        self.stats
            .payments_succeeded
            .fetch_add(report.recovered_success as u64, Ordering::Relaxed);
        self.stats
            .payments_failed
            .fetch_add(report.recovered_failure as u64, Ordering::Relaxed);
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Pipeline steps
    // ------------------------------------------------------------------

    async fn step_authenticate(&self, payment: Payment) -> Result<Payment, PaymentError> {
        let mut excluded: Vec<GatewayType> = Vec::new();

        loop {
            let gateway_type = match payment.gateway_type() {
                Some(bound) => bound,
                None => self.select_gateway(&payment, &excluded).await?,
            };

            let subject = payment.clone();
            let outcome = self
                .call_gateway(gateway_type, "authenticate", move |adapter| {
                    let payment = subject.clone();
                    async move { adapter.authenticate(&payment).await }
                })
                .await;

            match outcome {
                Ok(_) => {
                    let updated = self
                        .payments
                        .update_with(&payment.id(), move |p| p.authenticate(gateway_type))
                        .await?;
                    self.append_and_notify(PaymentEvent::authenticated(&updated, gateway_type))
                        .await?;
                    return Ok(updated);
                }
                Err(error @ PaymentError::CircuitOpen { .. })
                    if payment.gateway_type().is_none() =>
                {
                    tracing::warn!(
                        payment_id = %payment.id(),
                        gateway = %gateway_type,
                        "circuit open, trying alternate gateway"
                    );
                    self.hooks.notify_error(Some(payment.id()), &error).await;
                    excluded.push(gateway_type);
                }
                Err(error) => return Err(self.raise_step_error(payment, error).await),
            }
        }
    }

    async fn step_initiate(&self, payment: Payment) -> Result<Payment, PaymentError> {
        let gateway_type = payment.gateway_type().ok_or_else(|| {
            PaymentError::Internal("authenticated payment without a gateway".to_string())
        })?;

        let subject = payment.clone();
        let outcome = self
            .call_gateway(gateway_type, "initiate", move |adapter| {
                let payment = subject.clone();
                async move { adapter.initiate(&payment).await }
            })
            .await;

        match outcome {
            Ok(response) => {
                let transaction_id = response.gateway_transaction_id.clone();
                let event_transaction_id = transaction_id.clone();
                let updated = self
                    .payments
                    .update_with(&payment.id(), move |p| {
                        p.start_processing(transaction_id.clone())
                    })
                    .await?;
                self.append_and_notify(PaymentEvent::processing(&updated, event_transaction_id))
                    .await?;
                Ok(updated)
            }
            Err(error) => Err(self.raise_step_error(payment, error).await),
        }
    }

    async fn step_process(&self, payment: Payment) -> Result<Payment, PaymentError> {
        let gateway_type = payment.gateway_type().ok_or_else(|| {
            PaymentError::Internal("processing payment without a gateway".to_string())
        })?;

        let subject = payment.clone();
        let outcome = self
            .call_gateway(gateway_type, "process", move |adapter| {
                let payment = subject.clone();
                async move { adapter.process(&payment).await }
            })
            .await;

        match outcome {
            Ok(_) => {
                let updated = self
                    .payments
                    .update_with(&payment.id(), |p| p.mark_success())
                    .await?;
                self.append_and_notify(PaymentEvent::succeeded(&updated)).await?;
                self.stats.payments_succeeded.fetch_add(1, Ordering::Relaxed);
                self.hooks.notify_metrics(&updated).await;
                tracing::info!(payment_id = %updated.id(), "payment succeeded");
                Ok(updated)
            }
            Err(error) => Err(self.raise_step_error(payment, error).await),
        }
    }

    // ------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------

    /// Transition to FAILURE, append PAYMENT_FAILED, and return the failed
    /// payment.
    async fn fail(&self, payment: Payment, reason: String) -> Result<Payment, PaymentError> {
        let can_retry = payment.can_retry(self.config.retry.max_retries);
        let failed = self
            .payments
            .update_with(&payment.id(), move |p| p.mark_failure(reason.clone()))
            .await?;
        self.append_and_notify(PaymentEvent::failed(&failed, can_retry)).await?;
        self.stats.payments_failed.fetch_add(1, Ordering::Relaxed);
        self.hooks.notify_metrics(&failed).await;
        tracing::info!(
            payment_id = %failed.id(),
            reason = failed.failure_reason().unwrap_or(""),
            can_retry,
            "payment failed"
        );
        Ok(failed)
    }

    /// Map a step error to its terminal effect. Gateway and unknown errors
    /// transition the payment to FAILURE and re-raise; an open circuit
    /// leaves the payment non-terminal for a later attempt.
    async fn raise_step_error(&self, payment: Payment, error: PaymentError) -> PaymentError {
        if matches!(error, PaymentError::CircuitOpen { .. }) {
            self.hooks.notify_error(Some(payment.id()), &error).await;
            return error;
        }

        let reason = match &error {
            PaymentError::Gateway(e) => e.message.clone(),
            other => other.to_string(),
        };
        let id = payment.id();
        if let Err(fail_error) = self.fail(payment, reason).await {
            tracing::error!(
                payment_id = %id,
                error = %fail_error,
                "could not record FAILURE transition"
            );
        }
        self.hooks.notify_error(Some(id), &error).await;
        error
    }

    // ------------------------------------------------------------------
    // Gateway plumbing
    // ------------------------------------------------------------------

    /// Pick a gateway: hook override first, then declarative rules, then
    /// the weighted scoring engine.
    async fn select_gateway(
        &self,
        payment: &Payment,
        excluded: &[GatewayType],
    ) -> Result<GatewayType, PaymentError> {
        let mut candidates = self.gateways.types();
        candidates.retain(|g| !excluded.contains(g));
        if candidates.is_empty() {
            return Err(self.all_unavailable_error(excluded));
        }

        if let Some(proposal) = self
            .hooks
            .run_routing_override(payment, &candidates)
            .await
        {
            if candidates.contains(&proposal.gateway) && !self.is_open(proposal.gateway) {
                tracing::info!(
                    gateway = %proposal.gateway,
                    confidence = proposal.confidence,
                    reason = %proposal.reason,
                    "routing decided by strategy hook"
                );
                return Ok(proposal.gateway);
            }
        }

        for rule in &self.config.routing.rules {
            if rule.matches(payment.method().label(), payment.amount().currency())
                && candidates.contains(&rule.prefer)
                && !self.is_open(rule.prefer)
            {
                tracing::info!(gateway = %rule.prefer, "routing decided by configured rule");
                return Ok(rule.prefer);
            }
        }

        let metrics: HashMap<GatewayType, GatewayMetrics> = candidates
            .iter()
            .filter_map(|g| self.metrics.get(*g).map(|c| (*g, c.snapshot())))
            .collect();
        let health: HashMap<GatewayType, CircuitHealth> = candidates
            .iter()
            .map(|g| (*g, self.breakers.get_or_create(*g).health()))
            .collect();

        match self.routing.select(payment, &candidates, &metrics, &health) {
            Ok(decision) => {
                tracing::info!(reason = %decision.reason, "routing decision");
                Ok(decision.gateway)
            }
            Err(RoutingError::NoCandidates) => Err(PaymentError::Validation(
                "no gateway registered".to_string(),
            )),
            Err(RoutingError::AllUnavailable { candidates }) => {
                Err(self.all_unavailable_error(&candidates))
            }
        }
    }

    fn is_open(&self, gateway: GatewayType) -> bool {
        self.breakers.get_or_create(gateway).state() == CircuitState::Open
    }

    fn all_unavailable_error(&self, candidates: &[GatewayType]) -> PaymentError {
        match candidates.first() {
            Some(&gateway) => {
                let breaker = self.breakers.get_or_create(gateway);
                match breaker.check() {
                    Err(open) => PaymentError::CircuitOpen {
                        gateway: open.gateway.to_string(),
                        retry_after: open.retry_after,
                    },
                    Ok(()) => PaymentError::CircuitOpen {
                        gateway: gateway.to_string(),
                        retry_after: Duration::ZERO,
                    },
                }
            }
            None => PaymentError::Validation("no gateway registered".to_string()),
        }
    }

    /// Run one gateway operation breaker-inside-retry with a per-attempt
    /// deadline of the gateway's configured timeout.
    async fn call_gateway<F, Fut>(
        &self,
        gateway_type: GatewayType,
        operation: &str,
        call: F,
    ) -> Result<GatewayResponse, PaymentError>
    where
        F: Fn(Arc<dyn PaymentGateway>) -> Fut,
        Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
    {
        let registered = self.gateways.get(gateway_type).ok_or_else(|| {
            PaymentError::Validation(format!("gateway '{gateway_type}' not registered"))
        })?;
        let breaker = self.breakers.get_or_create(gateway_type);
        let collector = self.metrics.get_or_create(gateway_type, 0.0);
        let deadline = registered.config.timeout().unwrap_or(DEFAULT_GATEWAY_TIMEOUT);

        let executor = match registered.config.retry_attempts {
            Some(retries) => {
                let mut config = self.retry.config().clone();
                config.max_retries = retries;
                RetryExecutor::with_jitter(config, self.jitter.clone())
            }
            None => self.retry.clone(),
        };

        let attempts = AtomicU64::new(0);
        let adapter = registered.gateway.clone();

        let result = executor
            .execute(
                operation,
                || {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    let adapter = adapter.clone();
                    let breaker = breaker.clone();
                    let collector = collector.clone();
                    let call = &call;
                    async move {
                        breaker.check().map_err(|open| PaymentError::CircuitOpen {
                            gateway: open.gateway.to_string(),
                            retry_after: open.retry_after,
                        })?;

                        let start = Instant::now();
                        let outcome = tokio::time::timeout(deadline, call(adapter)).await;
                        let elapsed = start.elapsed();

                        match outcome {
                            Ok(Ok(response)) => {
                                breaker.record_success(elapsed);
                                collector.record(true, elapsed);
                                Ok(response)
                            }
                            Ok(Err(gateway_error)) => {
                                breaker.record_failure(elapsed);
                                collector.record(false, elapsed);
                                Err(PaymentError::Gateway(gateway_error))
                            }
                            Err(_) => {
                                breaker.record_failure(elapsed);
                                collector.record(false, elapsed);
                                Err(PaymentError::Gateway(GatewayError::timeout(
                                    gateway_type,
                                    elapsed,
                                )))
                            }
                        }
                    }
                },
                |error: &PaymentError| error.is_retryable(),
            )
            .await;

        let extra_attempts = attempts.load(Ordering::Relaxed).saturating_sub(1);
        self.stats
            .gateway_retries
            .fetch_add(extra_attempts, Ordering::Relaxed);

        match result {
            Ok(response) => Ok(response),
            Err(retry_error) => {
                if matches!(retry_error.last_error, PaymentError::CircuitOpen { .. }) {
                    self.stats
                        .circuit_open_rejections
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(retry_error.last_error)
            }
        }
    }

    async fn append_and_notify(&self, event: PaymentEvent) -> Result<(), PaymentError> {
        self.events.append(vec![event.clone()]).await?;
        self.hooks.notify_event_listeners(&event).await;
        Ok(())
    }
}
