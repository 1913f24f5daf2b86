//! Resilience primitives for gateway traffic.
//!
//! - **Retry**: exponential backoff with symmetric jitter and a
//!   domain-driven retryability filter.
//! - **Circuit breaker**: per-gateway fail-fast with health scoring and
//!   optional adaptive thresholds.
//!
//! The orchestrator composes them breaker-inside-retry: each retry attempt
//! consults the breaker, so an open circuit short-circuits the whole loop.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitHealth, CircuitOpenError, CircuitState,
};
pub use retry::{
    FixedJitter, JitterSource, RetryConfig, RetryError, RetryExecutor, ThreadRngJitter,
};
