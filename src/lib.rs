//! # Payflow
//!
//! **Payment orchestration core for Rust services.**
//!
//! Payflow accepts a merchant's intent to charge a customer, selects among
//! external payment processors, drives the charge through a strict
//! lifecycle, and guarantees exactly-once effect against those processors
//! despite retries, concurrent duplicate requests, process crashes, and
//! partial gateway failures.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! payflow = "0.1"
//! ```
//!
//! ## What's Included
//!
//! - **Idempotency engine** — request fingerprints, per-key leases, cached
//!   outcomes: the same key and body never charges twice.
//! - **Lifecycle state machine** — an explicit transition table; terminal
//!   states never move.
//! - **Resilient gateway calls** — per-gateway circuit breakers with health
//!   scoring composed inside exponential-backoff retries.
//! - **Intelligent routing** — weighted scoring over live success rate,
//!   latency, cost, and breaker health.
//! - **Event-sourced persistence** — gap-free event streams, optimistic
//!   CAS updates, and deterministic crash recovery via gateway
//!   reconciliation.
//! - **Hook pipeline** — validation, fraud, routing-override, enrichment,
//!   and listener filter points.
//!
//! See the [repository](https://github.com/payflow-rs/payflow) for more.

// Re-export everything from payflow-core
pub use payflow_core::*;
