//! Domain events for the payment stream.
//!
//! Wire shape is stable JSON: `{eventId, eventType, aggregateId, version,
//! timestamp, payload}` with `eventType` selecting the payload variant.
//! Events for one aggregate carry strictly contiguous versions starting at 1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::Money;
use super::payment::{Payment, PaymentId};
use crate::gateway::GatewayType;

/// Event type discriminator, used for filtered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentEventType {
    /// A payment was admitted.
    #[serde(rename = "PAYMENT_INITIATED")]
    Initiated,
    /// Customer authentication completed.
    #[serde(rename = "PAYMENT_AUTHENTICATED")]
    Authenticated,
    /// The gateway accepted the charge.
    #[serde(rename = "PAYMENT_PROCESSING")]
    Processing,
    /// The charge completed.
    #[serde(rename = "PAYMENT_SUCCEEDED")]
    Succeeded,
    /// The charge terminally failed.
    #[serde(rename = "PAYMENT_FAILED")]
    Failed,
    /// A retry attempt was admitted for a previously failed charge.
    #[serde(rename = "PAYMENT_RETRY_ATTEMPTED")]
    RetryAttempted,
}

impl PaymentEventType {
    /// Whether events of this type end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentEventType::Succeeded | PaymentEventType::Failed)
    }
}

/// Typed event payloads, tagged by `eventType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload")]
pub enum PaymentEventBody {
    /// Full initial snapshot, sufficient to rebuild the aggregate from empty.
    #[serde(rename = "PAYMENT_INITIATED")]
    Initiated {
        /// The admitted payment as of version 1.
        payment: Payment,
    },
    /// Gateway selection after successful authentication.
    #[serde(rename = "PAYMENT_AUTHENTICATED")]
    Authenticated {
        /// The gateway the payment was bound to.
        #[serde(rename = "gatewayType")]
        gateway_type: GatewayType,
    },
    /// Charge accepted by the gateway.
    #[serde(rename = "PAYMENT_PROCESSING")]
    Processing {
        /// Gateway-issued transaction id.
        #[serde(rename = "gatewayTransactionId")]
        gateway_transaction_id: String,
    },
    /// Charge completed.
    #[serde(rename = "PAYMENT_SUCCEEDED")]
    Succeeded {
        /// Gateway-issued transaction id.
        #[serde(rename = "gatewayTransactionId")]
        gateway_transaction_id: String,
        /// Settled amount.
        amount: Money,
    },
    /// Charge terminally failed.
    #[serde(rename = "PAYMENT_FAILED")]
    Failed {
        /// Human-readable failure reason.
        reason: String,
        /// Whether a retry driver may admit another attempt.
        #[serde(rename = "canRetry")]
        can_retry: bool,
    },
    /// Retry admission marker on the new attempt's stream.
    #[serde(rename = "PAYMENT_RETRY_ATTEMPTED")]
    RetryAttempted {
        /// 1-based attempt number.
        attempt: u32,
    },
}

impl PaymentEventBody {
    /// The discriminator for this payload.
    pub fn event_type(&self) -> PaymentEventType {
        match self {
            PaymentEventBody::Initiated { .. } => PaymentEventType::Initiated,
            PaymentEventBody::Authenticated { .. } => PaymentEventType::Authenticated,
            PaymentEventBody::Processing { .. } => PaymentEventType::Processing,
            PaymentEventBody::Succeeded { .. } => PaymentEventType::Succeeded,
            PaymentEventBody::Failed { .. } => PaymentEventType::Failed,
            PaymentEventBody::RetryAttempted { .. } => PaymentEventType::RetryAttempted,
        }
    }
}

/// One event in a payment's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    /// Unique event id.
    pub event_id: Uuid,
    /// Owning aggregate.
    pub aggregate_id: PaymentId,
    /// Position in the aggregate's stream, starting at 1.
    pub version: u64,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Typed payload, tagged by `eventType`.
    #[serde(flatten)]
    pub body: PaymentEventBody,
}

impl PaymentEvent {
    fn record(payment: &Payment, body: PaymentEventBody) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: payment.id(),
            version: payment.version(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// PAYMENT_INITIATED for a freshly admitted payment.
    pub fn initiated(payment: &Payment) -> Self {
        Self::record(
            payment,
            PaymentEventBody::Initiated {
                payment: payment.clone(),
            },
        )
    }

    /// PAYMENT_AUTHENTICATED for a payment that just authenticated.
    pub fn authenticated(payment: &Payment, gateway_type: GatewayType) -> Self {
        Self::record(payment, PaymentEventBody::Authenticated { gateway_type })
    }

    /// PAYMENT_PROCESSING for a payment the gateway just accepted.
    pub fn processing(payment: &Payment, gateway_transaction_id: impl Into<String>) -> Self {
        Self::record(
            payment,
            PaymentEventBody::Processing {
                gateway_transaction_id: gateway_transaction_id.into(),
            },
        )
    }

    /// PAYMENT_SUCCEEDED for a completed payment.
    pub fn succeeded(payment: &Payment) -> Self {
        Self::record(
            payment,
            PaymentEventBody::Succeeded {
                gateway_transaction_id: payment
                    .gateway_transaction_id()
                    .unwrap_or_default()
                    .to_string(),
                amount: *payment.amount(),
            },
        )
    }

    /// PAYMENT_FAILED for a terminally failed payment.
    pub fn failed(payment: &Payment, can_retry: bool) -> Self {
        Self::record(
            payment,
            PaymentEventBody::Failed {
                reason: payment.failure_reason().unwrap_or("unknown").to_string(),
                can_retry,
            },
        )
    }

    /// PAYMENT_RETRY_ATTEMPTED on a retry attempt's stream.
    pub fn retry_attempted(payment: &Payment) -> Self {
        Self::record(
            payment,
            PaymentEventBody::RetryAttempted {
                attempt: payment.retry_count(),
            },
        )
    }

    /// The event's type discriminator.
    pub fn event_type(&self) -> PaymentEventType {
        self.body.event_type()
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }
}
