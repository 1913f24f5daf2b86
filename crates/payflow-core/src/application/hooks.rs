//! Typed hook pipeline around the orchestrator.
//!
//! Hooks observe and advise; they never mutate a `Payment` directly — their
//! outputs feed the orchestrator. Pre-validation may block an admission and
//! fraud checks may deny a charge; everything else is best-effort:
//! individual failures are logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::domain::error::PaymentError;
use crate::domain::events::PaymentEvent;
use crate::domain::payment::{Payment, PaymentId};
use crate::gateway::GatewayType;

use super::CreatePaymentCommand;

/// Routing-strategy hooks below this confidence are ignored.
pub const MIN_ROUTING_CONFIDENCE: f64 = 0.7;

/// Bound on concurrently running event listeners.
const LISTENER_CONCURRENCY: usize = 8;

/// Per-listener deadline.
const LISTENER_TIMEOUT: Duration = Duration::from_secs(5);

/// Validates an incoming command before any state is created. May block.
#[async_trait]
pub trait ValidationHook: Send + Sync {
    /// Hook name, for logs and toggling.
    fn name(&self) -> &str;

    /// Reject the command by returning an error message.
    async fn validate(&self, command: &CreatePaymentCommand) -> Result<(), String>;
}

/// Observes a freshly admitted payment. Failures are logged, never blocking.
#[async_trait]
pub trait PostValidationHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Inspect the admitted payment.
    async fn validate(&self, payment: &Payment) -> Result<(), String>;
}

/// Verdict from a fraud-check hook.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudDecision {
    /// Whether the charge may proceed.
    pub allowed: bool,
    /// Reason when denied.
    pub reason: Option<String>,
}

impl FraudDecision {
    /// Allow the charge.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Deny the charge with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Screens a payment before it is sent to a gateway. May deny.
#[async_trait]
pub trait FraudCheckHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Render a verdict.
    async fn check(&self, payment: &Payment) -> FraudDecision;
}

/// A gateway override proposed by a routing-strategy hook.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingOverride {
    /// The proposed gateway.
    pub gateway: GatewayType,
    /// Confidence in [0, 1]; only proposals at or above
    /// [`MIN_ROUTING_CONFIDENCE`] are honored.
    pub confidence: f64,
    /// Why this gateway.
    pub reason: String,
}

/// Proposes a gateway ahead of the scoring engine.
#[async_trait]
pub trait RoutingStrategyHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Propose an override, or decline with `None`.
    async fn route(&self, payment: &Payment, candidates: &[GatewayType])
        -> Option<RoutingOverride>;
}

/// Contributes metadata to an admission.
#[async_trait]
pub trait EnrichmentHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Metadata entries to merge into the new payment.
    async fn enrich(&self, command: &CreatePaymentCommand)
        -> Result<HashMap<String, String>, String>;
}

/// Observes appended events, best-effort.
#[async_trait]
pub trait EventListenerHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn on_event(&self, event: &PaymentEvent);
}

/// Observes terminal payments for metrics export, best-effort.
#[async_trait]
pub trait MetricsHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Record a settled payment.
    async fn on_settled(&self, payment: &Payment);
}

/// Observes orchestration errors, best-effort.
#[async_trait]
pub trait ErrorHandlerHook: Send + Sync {
    /// Hook name.
    fn name(&self) -> &str;

    /// Handle one error.
    async fn on_error(&self, payment_id: Option<PaymentId>, error: &PaymentError);
}

/// One registered hook with its execution policy.
struct HookEntry<H: ?Sized> {
    hook: Arc<H>,
    priority: i32,
    enabled: bool,
}

impl<H: ?Sized> Clone for HookEntry<H> {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.clone(),
            priority: self.priority,
            enabled: self.enabled,
        }
    }
}

/// Hook list kinds, for toggling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Pre-admission command validation.
    PreValidation,
    /// Post-admission observation.
    PostValidation,
    /// Fraud screening.
    FraudCheck,
    /// Routing overrides.
    RoutingStrategy,
    /// Metadata enrichment.
    Enrichment,
    /// Event listeners.
    EventListener,
    /// Metrics export.
    Metrics,
    /// Error handlers.
    ErrorHandler,
}

/// Per-orchestrator hook registry. Higher priority runs first.
#[derive(Default)]
pub struct HookRegistry {
    pre_validation: RwLock<Vec<HookEntry<dyn ValidationHook>>>,
    post_validation: RwLock<Vec<HookEntry<dyn PostValidationHook>>>,
    fraud_checks: RwLock<Vec<HookEntry<dyn FraudCheckHook>>>,
    routing: RwLock<Vec<HookEntry<dyn RoutingStrategyHook>>>,
    enrichment: RwLock<Vec<HookEntry<dyn EnrichmentHook>>>,
    listeners: RwLock<Vec<HookEntry<dyn EventListenerHook>>>,
    metrics: RwLock<Vec<HookEntry<dyn MetricsHook>>>,
    error_handlers: RwLock<Vec<HookEntry<dyn ErrorHandlerHook>>>,
}

fn push_sorted<H: ?Sized>(list: &RwLock<Vec<HookEntry<H>>>, hook: Arc<H>, priority: i32) {
    let mut list = list.write();
    list.push(HookEntry {
        hook,
        priority,
        enabled: true,
    });
    list.sort_by_key(|entry| std::cmp::Reverse(entry.priority));
}

fn active<H: ?Sized>(list: &RwLock<Vec<HookEntry<H>>>) -> Vec<HookEntry<H>> {
    list.read()
        .iter()
        .filter(|entry| entry.enabled)
        .cloned()
        .collect()
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-validation hook.
    pub fn register_pre_validation(&self, hook: Arc<dyn ValidationHook>, priority: i32) {
        push_sorted(&self.pre_validation, hook, priority);
    }

    /// Register a post-validation hook.
    pub fn register_post_validation(&self, hook: Arc<dyn PostValidationHook>, priority: i32) {
        push_sorted(&self.post_validation, hook, priority);
    }

    /// Register a fraud-check hook.
    pub fn register_fraud_check(&self, hook: Arc<dyn FraudCheckHook>, priority: i32) {
        push_sorted(&self.fraud_checks, hook, priority);
    }

    /// Register a routing-strategy hook.
    pub fn register_routing_strategy(&self, hook: Arc<dyn RoutingStrategyHook>, priority: i32) {
        push_sorted(&self.routing, hook, priority);
    }

    /// Register an enrichment hook.
    pub fn register_enrichment(&self, hook: Arc<dyn EnrichmentHook>, priority: i32) {
        push_sorted(&self.enrichment, hook, priority);
    }

    /// Register an event listener.
    pub fn register_event_listener(&self, hook: Arc<dyn EventListenerHook>, priority: i32) {
        push_sorted(&self.listeners, hook, priority);
    }

    /// Register a metrics hook.
    pub fn register_metrics(&self, hook: Arc<dyn MetricsHook>, priority: i32) {
        push_sorted(&self.metrics, hook, priority);
    }

    /// Register an error handler.
    pub fn register_error_handler(&self, hook: Arc<dyn ErrorHandlerHook>, priority: i32) {
        push_sorted(&self.error_handlers, hook, priority);
    }

    /// Enable or disable a hook by kind and name. Returns whether a hook
    /// with that name was found.
    pub fn set_enabled(&self, kind: HookKind, name: &str, enabled: bool) -> bool {
        fn toggle<H: ?Sized>(
            list: &RwLock<Vec<HookEntry<H>>>,
            name: &str,
            enabled: bool,
            name_of: impl Fn(&H) -> String,
        ) -> bool {
            let mut found = false;
            for entry in list.write().iter_mut() {
                if name_of(entry.hook.as_ref()) == name {
                    entry.enabled = enabled;
                    found = true;
                }
            }
            found
        }

        match kind {
            HookKind::PreValidation => {
                toggle(&self.pre_validation, name, enabled, |h| h.name().to_string())
            }
            HookKind::PostValidation => {
                toggle(&self.post_validation, name, enabled, |h| h.name().to_string())
            }
            HookKind::FraudCheck => {
                toggle(&self.fraud_checks, name, enabled, |h| h.name().to_string())
            }
            HookKind::RoutingStrategy => {
                toggle(&self.routing, name, enabled, |h| h.name().to_string())
            }
            HookKind::Enrichment => {
                toggle(&self.enrichment, name, enabled, |h| h.name().to_string())
            }
            HookKind::EventListener => {
                toggle(&self.listeners, name, enabled, |h| h.name().to_string())
            }
            HookKind::Metrics => toggle(&self.metrics, name, enabled, |h| h.name().to_string()),
            HookKind::ErrorHandler => {
                toggle(&self.error_handlers, name, enabled, |h| h.name().to_string())
            }
        }
    }

    /// Run pre-validation hooks in priority order; the first rejection
    /// blocks the admission.
    pub async fn run_pre_validation(
        &self,
        command: &CreatePaymentCommand,
    ) -> Result<(), PaymentError> {
        for entry in active(&self.pre_validation) {
            if let Err(message) = entry.hook.validate(command).await {
                return Err(PaymentError::Validation(format!(
                    "{}: {}",
                    entry.hook.name(),
                    message
                )));
            }
        }
        Ok(())
    }

    /// Run post-validation hooks; failures are logged and swallowed.
    pub async fn run_post_validation(&self, payment: &Payment) {
        for entry in active(&self.post_validation) {
            if let Err(message) = entry.hook.validate(payment).await {
                tracing::warn!(
                    hook = entry.hook.name(),
                    payment_id = %payment.id(),
                    %message,
                    "post-validation hook failed"
                );
            }
        }
    }

    /// Run fraud checks in priority order, short-circuiting on the first
    /// denial.
    pub async fn run_fraud_checks(&self, payment: &Payment) -> Result<(), String> {
        for entry in active(&self.fraud_checks) {
            let decision = entry.hook.check(payment).await;
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| format!("denied by {}", entry.hook.name()));
                return Err(reason);
            }
        }
        Ok(())
    }

    /// Ask routing-strategy hooks for an override; the first proposal with
    /// sufficient confidence wins.
    pub async fn run_routing_override(
        &self,
        payment: &Payment,
        candidates: &[GatewayType],
    ) -> Option<RoutingOverride> {
        for entry in active(&self.routing) {
            if let Some(proposal) = entry.hook.route(payment, candidates).await {
                if proposal.confidence >= MIN_ROUTING_CONFIDENCE {
                    return Some(proposal);
                }
                tracing::debug!(
                    hook = entry.hook.name(),
                    confidence = proposal.confidence,
                    "routing override below confidence floor, ignoring"
                );
            }
        }
        None
    }

    /// Collect enrichment metadata; failing hooks are logged and skipped.
    pub async fn run_enrichment(&self, command: &CreatePaymentCommand) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for entry in active(&self.enrichment) {
            match entry.hook.enrich(command).await {
                Ok(extra) => merged.extend(extra),
                Err(message) => {
                    tracing::warn!(
                        hook = entry.hook.name(),
                        %message,
                        "enrichment hook failed"
                    );
                }
            }
        }
        merged
    }

    /// Fan an event out to listeners: concurrent, bounded, per-hook timeout,
    /// individual failures logged and never propagated.
    pub async fn notify_event_listeners(&self, event: &PaymentEvent) {
        let listeners = active(&self.listeners);

        for batch in listeners.chunks(LISTENER_CONCURRENCY) {
            let mut tasks = JoinSet::new();
            for entry in batch {
                let hook = entry.hook.clone();
                let event = event.clone();
                tasks.spawn(async move {
                    let name = hook.name().to_string();
                    if tokio::time::timeout(LISTENER_TIMEOUT, hook.on_event(&event))
                        .await
                        .is_err()
                    {
                        tracing::warn!(hook = %name, "event listener timed out");
                    }
                });
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(error) = result {
                    tracing::warn!(error = %error, "event listener panicked");
                }
            }
        }
    }

    /// Notify metrics hooks of a settled payment, best-effort.
    pub async fn notify_metrics(&self, payment: &Payment) {
        for entry in active(&self.metrics) {
            if tokio::time::timeout(LISTENER_TIMEOUT, entry.hook.on_settled(payment))
                .await
                .is_err()
            {
                tracing::warn!(hook = entry.hook.name(), "metrics hook timed out");
            }
        }
    }

    /// Notify error handlers, best-effort.
    pub async fn notify_error(&self, payment_id: Option<PaymentId>, error: &PaymentError) {
        for entry in active(&self.error_handlers) {
            if tokio::time::timeout(LISTENER_TIMEOUT, entry.hook.on_error(payment_id, error))
                .await
                .is_err()
            {
                tracing::warn!(hook = entry.hook.name(), "error handler timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::money::Currency;
    use crate::domain::payment::{Customer, PaymentMethod};

    fn command() -> CreatePaymentCommand {
        CreatePaymentCommand {
            merchant_id: "m1".into(),
            idempotency_key: "k1".into(),
            amount: Decimal::new(10000, 2),
            currency: Currency::USD,
            method: PaymentMethod::Upi {
                vpa: "alice@upi".into(),
            },
            customer: Customer::with_id("c1"),
            metadata: StdHashMap::new(),
        }
    }

    fn payment() -> Payment {
        command().into_payment(StdHashMap::new()).unwrap()
    }

    struct NamedValidator {
        name: String,
        fail_with: Option<String>,
        order: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ValidationHook for NamedValidator {
        fn name(&self) -> &str {
            &self.name
        }

        async fn validate(&self, _command: &CreatePaymentCommand) -> Result<(), String> {
            self.order.lock().unwrap().push(self.name.clone());
            match &self.fail_with {
                Some(message) => Err(message.clone()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_pre_validation_runs_in_priority_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            registry.register_pre_validation(
                Arc::new(NamedValidator {
                    name: name.into(),
                    fail_with: None,
                    order: order.clone(),
                }),
                priority,
            );
        }

        registry.run_pre_validation(&command()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_pre_validation_failure_blocks() {
        let registry = HookRegistry::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        registry.register_pre_validation(
            Arc::new(NamedValidator {
                name: "blocker".into(),
                fail_with: Some("amount too large".into()),
                order: order.clone(),
            }),
            10,
        );
        registry.register_pre_validation(
            Arc::new(NamedValidator {
                name: "never".into(),
                fail_with: None,
                order: order.clone(),
            }),
            1,
        );

        let err = registry.run_pre_validation(&command()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(message) if message.contains("blocker")));
        assert_eq!(*order.lock().unwrap(), vec!["blocker"]);
    }

    #[tokio::test]
    async fn test_disabled_hooks_are_skipped() {
        let registry = HookRegistry::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        registry.register_pre_validation(
            Arc::new(NamedValidator {
                name: "blocker".into(),
                fail_with: Some("no".into()),
                order: order.clone(),
            }),
            10,
        );

        assert!(registry.set_enabled(HookKind::PreValidation, "blocker", false));
        registry.run_pre_validation(&command()).await.unwrap();
        assert!(order.lock().unwrap().is_empty());
    }

    struct DenyAll;

    #[async_trait]
    impl FraudCheckHook for DenyAll {
        fn name(&self) -> &str {
            "deny-all"
        }

        async fn check(&self, _payment: &Payment) -> FraudDecision {
            FraudDecision::deny("always suspicious")
        }
    }

    struct CountingFraud(Arc<AtomicU32>);

    #[async_trait]
    impl FraudCheckHook for CountingFraud {
        fn name(&self) -> &str {
            "counting"
        }

        async fn check(&self, _payment: &Payment) -> FraudDecision {
            self.0.fetch_add(1, Ordering::SeqCst);
            FraudDecision::allow()
        }
    }

    #[tokio::test]
    async fn test_fraud_check_short_circuits_on_denial() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        registry.register_fraud_check(Arc::new(DenyAll), 10);
        registry.register_fraud_check(Arc::new(CountingFraud(calls.clone())), 1);

        let reason = registry.run_fraud_checks(&payment()).await.unwrap_err();
        assert_eq!(reason, "always suspicious");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct ConfidentRouter(f64);

    #[async_trait]
    impl RoutingStrategyHook for ConfidentRouter {
        fn name(&self) -> &str {
            "router"
        }

        async fn route(
            &self,
            _payment: &Payment,
            _candidates: &[GatewayType],
        ) -> Option<RoutingOverride> {
            Some(RoutingOverride {
                gateway: GatewayType::Razorpay,
                confidence: self.0,
                reason: "regional preference".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_routing_override_requires_confidence() {
        let registry = HookRegistry::new();
        registry.register_routing_strategy(Arc::new(ConfidentRouter(0.5)), 10);
        assert!(registry
            .run_routing_override(&payment(), &[GatewayType::Stripe])
            .await
            .is_none());

        registry.register_routing_strategy(Arc::new(ConfidentRouter(0.9)), 1);
        let chosen = registry
            .run_routing_override(&payment(), &[GatewayType::Stripe])
            .await
            .unwrap();
        assert_eq!(chosen.gateway, GatewayType::Razorpay);
    }

    struct RegionEnricher;

    #[async_trait]
    impl EnrichmentHook for RegionEnricher {
        fn name(&self) -> &str {
            "region"
        }

        async fn enrich(
            &self,
            _command: &CreatePaymentCommand,
        ) -> Result<HashMap<String, String>, String> {
            Ok(HashMap::from([("region".to_string(), "apac".to_string())]))
        }
    }

    struct BrokenEnricher;

    #[async_trait]
    impl EnrichmentHook for BrokenEnricher {
        fn name(&self) -> &str {
            "broken"
        }

        async fn enrich(
            &self,
            _command: &CreatePaymentCommand,
        ) -> Result<HashMap<String, String>, String> {
            Err("lookup failed".into())
        }
    }

    #[tokio::test]
    async fn test_enrichment_merges_and_swallows_failures() {
        let registry = HookRegistry::new();
        registry.register_enrichment(Arc::new(RegionEnricher), 1);
        registry.register_enrichment(Arc::new(BrokenEnricher), 10);

        let merged = registry.run_enrichment(&command()).await;
        assert_eq!(merged.get("region"), Some(&"apac".to_string()));
    }

    struct CountingListener(Arc<AtomicU32>);

    #[async_trait]
    impl EventListenerHook for CountingListener {
        fn name(&self) -> &str {
            "counter"
        }

        async fn on_event(&self, _event: &PaymentEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickyListener;

    #[async_trait]
    impl EventListenerHook for PanickyListener {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn on_event(&self, _event: &PaymentEvent) {
            panic!("listener exploded");
        }
    }

    #[tokio::test]
    async fn test_listener_panics_do_not_propagate() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        registry.register_event_listener(Arc::new(PanickyListener), 10);
        registry.register_event_listener(Arc::new(CountingListener(calls.clone())), 1);

        let event = PaymentEvent::initiated(&payment());
        registry.notify_event_listeners(&event).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
