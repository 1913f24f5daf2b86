//! # Payflow Core
//!
//! The payment orchestration core: accept a merchant's intent to charge,
//! route it across external processors, drive it through a strict lifecycle,
//! and guarantee exactly-once effect despite retries, duplicates, crashes,
//! and partial gateway failures.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use payflow_core::prelude::*;
//!
//! let orchestrator = PaymentOrchestrator::new(OrchestratorConfig::default());
//! orchestrator.register_gateway(
//!     GatewayType::Stripe,
//!     GatewayConfig::with_api_key("sk_live_..."),
//!     stripe_adapter,
//! );
//!
//! let payment = orchestrator.create_payment(command).await?;
//! let settled = orchestrator.process_payment(&payment.id()).await?;
//! ```
//!
//! ## Layout
//!
//! - [`domain`] — money, the immutable `Payment` aggregate, its lifecycle
//!   state machine, and domain events.
//! - [`idempotency`] — exactly-once admission with request fingerprints.
//! - [`lock`] — named mutual-exclusion leases with TTL.
//! - [`resilience`] — retry policy and per-gateway circuit breakers.
//! - [`gateway`] — the processor port, error vocabulary, and rolling
//!   metrics.
//! - [`routing`] — weighted gateway scoring.
//! - [`eventstore`] — append-only event log and replay.
//! - [`repository`] — optimistic-lock persistence.
//! - [`application`] — the orchestrator, hooks, configuration, recovery.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Application layer: orchestrator, hooks, config, recovery.
pub mod application;

/// Domain model: money, payments, lifecycle, events, errors.
pub mod domain;

/// Append-only event log and event-sourced reconstruction.
pub mod eventstore;

/// Gateway port, error vocabulary, and rolling metrics.
pub mod gateway;

/// Exactly-once admission.
pub mod idempotency;

/// Named mutual-exclusion leases.
pub mod lock;

/// Versioned persistence with compare-and-swap updates.
pub mod repository;

/// Retry and circuit-breaking primitives.
pub mod resilience;

/// Weighted gateway selection.
pub mod routing;

/// The most commonly used types in one import.
pub mod prelude {
    pub use crate::application::{
        CreatePaymentCommand, HookRegistry, OrchestratorConfig, PaymentOrchestrator,
    };
    pub use crate::domain::{
        Currency, Customer, Money, Payment, PaymentError, PaymentEvent, PaymentEventType,
        PaymentId, PaymentMethod, PaymentState,
    };
    pub use crate::gateway::{
        GatewayConfig, GatewayError, GatewayErrorCode, GatewayPaymentStatus, GatewayResponse,
        GatewayType, PaymentGateway,
    };
}
