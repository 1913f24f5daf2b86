//! tests/01_payment_lifecycle.rs
//!
//! End-to-end lifecycle: a payment admitted through the orchestrator is
//! driven INITIATED -> AUTHENTICATED -> PROCESSING -> SUCCESS with a
//! contiguous event stream, and the aggregate serializes losslessly.

mod common;

use std::sync::Arc;

use common::{command, fast_config, ScriptedGateway};
use payflow::application::PaymentOrchestrator;
use payflow::domain::{Payment, PaymentEventType, PaymentState};
use payflow::eventstore::{EventStore, InMemoryEventStore};
use payflow::gateway::{GatewayConfig, GatewayType};

fn orchestrator_with_events() -> (PaymentOrchestrator, Arc<InMemoryEventStore>) {
    let events = Arc::new(InMemoryEventStore::new());
    let orchestrator =
        PaymentOrchestrator::new(fast_config()).with_event_store(events.clone());
    orchestrator.register_gateway(
        GatewayType::Stripe,
        GatewayConfig::with_api_key("sk_test"),
        Arc::new(ScriptedGateway::succeeding(GatewayType::Stripe)),
    );
    (orchestrator, events)
}

/// Scenario: create then process; expect the four-event stream and a
/// SUCCESS terminal state.
#[tokio::test]
async fn test_happy_path_emits_contiguous_stream() {
    let (orchestrator, events) = orchestrator_with_events();

    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    assert_eq!(payment.state(), PaymentState::Initiated);
    assert_eq!(payment.version(), 1);

    let settled = orchestrator.process_payment(&payment.id()).await.unwrap();
    assert_eq!(settled.state(), PaymentState::Success);

    let stream = events.events(&payment.id()).await.unwrap();
    let expected = [
        PaymentEventType::Initiated,
        PaymentEventType::Authenticated,
        PaymentEventType::Processing,
        PaymentEventType::Succeeded,
    ];
    assert_eq!(stream.len(), expected.len());
    for (index, (event, expected_type)) in stream.iter().zip(expected).enumerate() {
        assert_eq!(event.version, index as u64 + 1);
        assert_eq!(event.event_type(), expected_type);
        assert_eq!(event.aggregate_id, payment.id());
    }

    // Timestamps never run backwards within the chain.
    for pair in stream.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

/// No SUCCESS exists without a persisted PAYMENT_SUCCEEDED event.
#[tokio::test]
async fn test_success_implies_succeeded_event() {
    let (orchestrator, events) = orchestrator_with_events();

    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    let settled = orchestrator.process_payment(&payment.id()).await.unwrap();
    assert_eq!(settled.state(), PaymentState::Success);

    let succeeded = events
        .events_by_type(PaymentEventType::Succeeded)
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].aggregate_id, settled.id());
}

/// Law: Payment -> JSON -> Payment is the identity.
#[tokio::test]
async fn test_payment_json_round_trip() {
    let (orchestrator, _) = orchestrator_with_events();
    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    let settled = orchestrator.process_payment(&payment.id()).await.unwrap();

    let json = serde_json::to_string(&settled).unwrap();
    let back: Payment = serde_json::from_str(&json).unwrap();
    assert_eq!(settled, back);
}

/// The versioned repository and event stream agree after processing.
#[tokio::test]
async fn test_stored_version_matches_stream_length() {
    let (orchestrator, events) = orchestrator_with_events();
    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    orchestrator.process_payment(&payment.id()).await.unwrap();

    let stored = orchestrator.get_payment(&payment.id()).await.unwrap();
    let current = events.current_version(&payment.id()).await.unwrap();
    assert_eq!(stored.version(), current);
}

/// Processing an already terminal payment short-circuits without new events.
#[tokio::test]
async fn test_terminal_payment_short_circuits() {
    let (orchestrator, events) = orchestrator_with_events();
    let payment = orchestrator.create_payment(command("k1")).await.unwrap();
    orchestrator.process_payment(&payment.id()).await.unwrap();

    let before = events.events(&payment.id()).await.unwrap().len();
    let again = orchestrator.process_payment(&payment.id()).await.unwrap();
    let after = events.events(&payment.id()).await.unwrap().len();

    assert_eq!(again.state(), PaymentState::Success);
    assert_eq!(before, after);
}
