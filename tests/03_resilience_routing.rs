//! tests/03_resilience_routing.rs
//!
//! Gateway-facing resilience: transient failures retry inside one attempt,
//! sustained failures open the circuit, probes close it again, and routing
//! steers new charges toward healthy gateways.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{command, fast_config, ScriptedGateway};
use payflow::application::{OverallHealth, PaymentOrchestrator};
use payflow::domain::{PaymentError, PaymentEventType, PaymentState};
use payflow::eventstore::{EventStore, InMemoryEventStore};
use payflow::gateway::{GatewayConfig, GatewayErrorCode, GatewayType, PaymentGateway};

fn orchestrator_with_events(
    gateway: ScriptedGateway,
) -> (PaymentOrchestrator, Arc<InMemoryEventStore>) {
    let events = Arc::new(InMemoryEventStore::new());
    let orchestrator =
        PaymentOrchestrator::new(fast_config()).with_event_store(events.clone());
    let gateway_type = gateway.gateway_type();
    orchestrator.register_gateway(
        gateway_type,
        GatewayConfig::with_api_key("sk_test"),
        Arc::new(gateway),
    );
    (orchestrator, events)
}

/// Scenario: the gateway times out twice then succeeds. One SUCCEEDED
/// event, retry telemetry reads 2, and the transaction id is stable.
#[tokio::test]
async fn test_transient_timeouts_retry_within_attempt() {
    let gateway = ScriptedGateway::succeeding(GatewayType::Stripe).script(
        "process",
        vec![
            Err(GatewayErrorCode::Timeout),
            Err(GatewayErrorCode::Timeout),
            Ok(()),
        ],
    );
    let (orchestrator, events) = orchestrator_with_events(gateway);

    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    let settled = orchestrator.process_payment(&payment.id()).await.unwrap();
    assert_eq!(settled.state(), PaymentState::Success);

    let succeeded = events
        .events_by_type(PaymentEventType::Succeeded)
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(orchestrator.get_metrics().gateway_retries, 2);
    assert_eq!(settled.gateway_transaction_id(), Some("txn_stripe"));
}

/// Scenario: three consecutive hard failures open the circuit; the next
/// call fast-fails with CircuitOpen; after the open timeout two probe
/// successes close it.
#[tokio::test]
async fn test_breaker_opens_then_recovers() {
    let gateway = ScriptedGateway::succeeding(GatewayType::Stripe).script(
        "authenticate",
        vec![
            Err(GatewayErrorCode::InvalidRequest),
            Err(GatewayErrorCode::InvalidRequest),
            Err(GatewayErrorCode::InvalidRequest),
        ],
    );
    let (orchestrator, _) = orchestrator_with_events(gateway);

    // Three payments each take one non-retryable failure.
    for key in ["k1", "k2", "k3"] {
        let payment = orchestrator.create_payment(command(key)).await.unwrap();
        let err = orchestrator.process_payment(&payment.id()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Gateway(_)));
    }
    assert_eq!(
        orchestrator.get_health_summary().overall,
        OverallHealth::Unhealthy
    );

    // Fourth call fast-fails without reaching the gateway.
    let blocked = orchestrator.create_payment(command("k4")).await.unwrap();
    let err = orchestrator.process_payment(&blocked.id()).await.unwrap_err();
    assert!(matches!(err, PaymentError::CircuitOpen { .. }));
    let stored = orchestrator.get_payment(&blocked.id()).await.unwrap();
    assert_eq!(stored.state(), PaymentState::Initiated);

    // After the open timeout the breaker admits probes; a full pipeline
    // run (authenticate + initiate + process) supplies the two successes
    // that close it.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let settled = orchestrator.process_payment(&blocked.id()).await.unwrap();
    assert_eq!(settled.state(), PaymentState::Success);
    assert_eq!(
        orchestrator.get_health_summary().overall,
        OverallHealth::Healthy
    );
}

/// Routing prefers the healthy gateway once the failing one has observable
/// metrics.
#[tokio::test]
async fn test_routing_steers_away_from_failing_gateway() {
    let config = {
        let mut config = fast_config();
        config.routing.min_samples = 2;
        config
    };

    let orchestrator = PaymentOrchestrator::new(config);
    // Adyen sorts first and would win ties, but it declines everything.
    orchestrator.register_gateway(
        GatewayType::Adyen,
        GatewayConfig::with_api_key("sk_test"),
        Arc::new(ScriptedGateway::succeeding(GatewayType::Adyen).script(
            "authenticate",
            vec![
                Err(GatewayErrorCode::InvalidRequest),
                Err(GatewayErrorCode::InvalidRequest),
            ],
        )),
    );
    orchestrator.register_gateway(
        GatewayType::Stripe,
        GatewayConfig::with_api_key("sk_test"),
        Arc::new(ScriptedGateway::succeeding(GatewayType::Stripe)),
    );

    // Two payments burn Adyen's scripted failures and build its track
    // record.
    for key in ["k1", "k2"] {
        let payment = orchestrator.create_payment(command(key)).await.unwrap();
        let _ = orchestrator.process_payment(&payment.id()).await;
    }

    // With Adyen's success rate at zero, the next charge routes to Stripe.
    let payment = orchestrator.create_payment(command("k3")).await.unwrap();
    let settled = orchestrator.process_payment(&payment.id()).await.unwrap();
    assert_eq!(settled.state(), PaymentState::Success);
    assert_eq!(settled.gateway_type(), Some(GatewayType::Stripe));
}

/// Per-gateway metrics reflect both sides of the traffic.
#[tokio::test]
async fn test_gateway_metrics_capture_failures() {
    let gateway = ScriptedGateway::succeeding(GatewayType::Stripe)
        .script("process", vec![Err(GatewayErrorCode::Timeout), Ok(())]);
    let (orchestrator, _) = orchestrator_with_events(gateway);

    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    orchestrator.process_payment(&payment.id()).await.unwrap();

    let metrics = orchestrator.get_gateway_metrics();
    assert_eq!(metrics.len(), 1);
    // authenticate + initiate + 2x process (one timeout, one success)
    assert_eq!(metrics[0].success_count, 3);
    assert_eq!(metrics[0].failure_count, 1);
    assert!(metrics[0].success_rate < 1.0);
    assert!(metrics[0].avg_latency > Duration::ZERO);
}
