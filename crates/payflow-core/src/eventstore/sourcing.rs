//! Aggregate reconstruction by event replay.
//!
//! State is rebuilt with a left-fold over the ordered event sequence,
//! starting from the PAYMENT_INITIATED snapshot and re-applying each later
//! event through the same lifecycle guards that produced it. Continuity is
//! validated first: versions must be exactly `1..=n`.

use std::sync::Arc;

use crate::domain::error::PaymentError;
use crate::domain::events::{PaymentEvent, PaymentEventBody};
use crate::domain::payment::{Payment, PaymentId};

use super::EventStore;

/// Rebuild a payment from its ordered event stream.
pub fn replay(events: &[PaymentEvent]) -> Result<Payment, PaymentError> {
    let first = events.first().ok_or_else(|| PaymentError::EventContinuity {
        aggregate_id: "<unknown>".to_string(),
        detail: "empty stream".to_string(),
    })?;
    let aggregate_id = first.aggregate_id;

    validate_continuity(aggregate_id, events)?;

    let mut payment = match &first.body {
        PaymentEventBody::Initiated { payment } => payment.clone(),
        other => {
            return Err(PaymentError::EventContinuity {
                aggregate_id: aggregate_id.to_string(),
                detail: format!("stream starts with {:?}", other.event_type()),
            })
        }
    };

    for event in &events[1..] {
        payment = apply(payment, event)?;
        if payment.version() != event.version {
            return Err(PaymentError::EventContinuity {
                aggregate_id: aggregate_id.to_string(),
                detail: format!(
                    "replayed version {} does not match event version {}",
                    payment.version(),
                    event.version
                ),
            });
        }
    }
    Ok(payment)
}

fn validate_continuity(aggregate_id: PaymentId, events: &[PaymentEvent]) -> Result<(), PaymentError> {
    for (index, event) in events.iter().enumerate() {
        if event.aggregate_id != aggregate_id {
            return Err(PaymentError::EventContinuity {
                aggregate_id: aggregate_id.to_string(),
                detail: format!("foreign event for {}", event.aggregate_id),
            });
        }
        let expected = index as u64 + 1;
        if event.version != expected {
            return Err(PaymentError::EventContinuity {
                aggregate_id: aggregate_id.to_string(),
                detail: format!("expected version {expected}, found {}", event.version),
            });
        }
    }
    Ok(())
}

fn apply(payment: Payment, event: &PaymentEvent) -> Result<Payment, PaymentError> {
    let aggregate_id = event.aggregate_id;
    match &event.body {
        PaymentEventBody::Initiated { .. } => Err(PaymentError::EventContinuity {
            aggregate_id: aggregate_id.to_string(),
            detail: "duplicate PAYMENT_INITIATED".to_string(),
        }),
        PaymentEventBody::Authenticated { gateway_type } => payment
            .authenticate(*gateway_type)
            .map_err(|e| corrupt(aggregate_id, e)),
        PaymentEventBody::Processing {
            gateway_transaction_id,
        } => payment
            .start_processing(gateway_transaction_id.clone())
            .map_err(|e| corrupt(aggregate_id, e)),
        PaymentEventBody::Succeeded { .. } => {
            payment.mark_success().map_err(|e| corrupt(aggregate_id, e))
        }
        PaymentEventBody::Failed { reason, .. } => payment
            .mark_failure(reason.clone())
            .map_err(|e| corrupt(aggregate_id, e)),
        PaymentEventBody::RetryAttempted { attempt } => {
            Ok(payment.record_retry_attempt(*attempt))
        }
    }
}

fn corrupt(aggregate_id: PaymentId, error: PaymentError) -> PaymentError {
    PaymentError::EventContinuity {
        aggregate_id: aggregate_id.to_string(),
        detail: format!("stream replays an invalid transition: {error}"),
    }
}

/// Loads aggregates from the event store and enumerates streams that crash
/// recovery must reconcile.
pub struct SourcingCoordinator<S: EventStore + ?Sized> {
    store: Arc<S>,
}

impl<S: EventStore + ?Sized> SourcingCoordinator<S> {
    /// Coordinator over an event store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Rebuild the current state of one aggregate.
    pub async fn load(&self, aggregate_id: &PaymentId) -> Result<Payment, PaymentError> {
        let events = self.store.events(aggregate_id).await?;
        if events.is_empty() {
            return Err(PaymentError::NotFound(aggregate_id.to_string()));
        }
        replay(&events)
    }

    /// Aggregates whose latest event is non-terminal.
    pub async fn non_terminal_aggregates(&self) -> Result<Vec<PaymentId>, PaymentError> {
        let mut pending = Vec::new();
        for aggregate_id in self.store.aggregate_ids().await? {
            let events = self.store.events(&aggregate_id).await?;
            if let Some(last) = events.last() {
                if !last.is_terminal() {
                    pending.push(aggregate_id);
                }
            }
        }
        Ok(pending)
    }
}
