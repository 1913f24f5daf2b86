//! Configuration layer for the orchestrator.
//!
//! One TOML-loadable object with a section per concern. Every field has a
//! default, so partial files (or `OrchestratorConfig::default()`) are always
//! valid starting points.
//!
//! # Example TOML configuration
//!
//! ```toml
//! [routing]
//! strategy = "weighted_score"
//! weights = { success = 0.4, latency = 0.25, cost = 0.15, health = 0.2 }
//!
//! [[routing.rules]]
//! method = "upi"
//! prefer = "razorpay"
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 200
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! adaptive_thresholds = true
//!
//! [idempotency]
//! ttl_ms = 86400000
//!
//! [optimistic_lock]
//! max_retries = 5
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::money::Currency;
use crate::gateway::GatewayType;
use crate::idempotency::IdempotencyConfig;
use crate::repository::OptimisticLockConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::routing::{RoutingEngine, RoutingWeights};

/// Errors from configuration loading.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// File read failure.
    #[error("io error: {0}")]
    Io(String),

    /// TOML parse failure.
    #[error("toml parsing error: {0}")]
    Toml(String),

    /// Structurally valid but semantically wrong configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level orchestrator configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Gateway selection.
    #[serde(default)]
    pub routing: RoutingSection,

    /// Gateway-call retry policy.
    #[serde(default)]
    pub retry: RetrySection,

    /// Per-gateway circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    /// Idempotent admission.
    #[serde(default)]
    pub idempotency: IdempotencySection,

    /// Optimistic-lock retry on persistence.
    #[serde(default)]
    pub optimistic_lock: OptimisticLockSection,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(weights) = &self.routing.weights {
            weights
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.failure_rate_threshold) {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_rate_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Invalid(
                "retry.jitter_factor must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Routing configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingSection {
    /// Selection strategy. Only `weighted_score` is built in; anything else
    /// must come from a routing-strategy hook.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Scoring weights; defaults favor success rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<RoutingWeights>,

    /// Outcomes a gateway must accumulate before its metrics are trusted.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,

    /// Declarative pre-routing rules, checked before scoring.
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            weights: None,
            min_samples: default_min_samples(),
            rules: Vec::new(),
        }
    }
}

impl RoutingSection {
    /// Build the scoring engine for this section.
    pub fn to_engine(&self) -> RoutingEngine {
        RoutingEngine::new(self.weights.unwrap_or_default(), self.min_samples)
    }
}

fn default_strategy() -> String {
    "weighted_score".to_string()
}

fn default_min_samples() -> u32 {
    10
}

/// A declarative routing preference: when the payment matches, prefer the
/// named gateway (still subject to its circuit being closed).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Match on payment method label (`card`, `upi`, ...), if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Match on currency, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,

    /// Preferred gateway when the rule matches.
    pub prefer: GatewayType,
}

impl RoutingRule {
    /// Whether the rule matches a payment's method label and currency.
    pub fn matches(&self, method_label: &str, currency: Currency) -> bool {
        if let Some(method) = &self.method {
            if method != method_label {
                return false;
            }
        }
        if let Some(rule_currency) = self.currency {
            if rule_currency != currency {
                return false;
            }
        }
        true
    }
}

/// Gateway-call retry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrySection {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Cap on the computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential multiplier.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter amplitude in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_multiplier(),
            jitter_factor: default_jitter(),
        }
    }
}

impl RetrySection {
    /// Convert to the resilience-layer config.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_jitter_factor(self.jitter_factor)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling failure rate that opens the circuit, in [0, 1].
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Minimum rolling samples before the rate condition applies.
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u32,

    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Open duration before probing, in milliseconds.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Retry-after hint when half-open capacity is saturated, in
    /// milliseconds.
    #[serde(default = "default_half_open_timeout_ms")]
    pub half_open_timeout_ms: u64,

    /// Maximum concurrent half-open probes.
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,

    /// Scale thresholds with the health score.
    #[serde(default)]
    pub adaptive_thresholds: bool,

    /// Floor for adaptive scaling.
    #[serde(default = "default_min_health_score")]
    pub min_health_score: f64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            min_sample_size: default_min_sample_size(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_timeout_ms: default_half_open_timeout_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
            adaptive_thresholds: false,
            min_health_score: default_min_health_score(),
        }
    }
}

impl CircuitBreakerSection {
    /// Convert to the resilience-layer config.
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.failure_threshold)
            .with_failure_rate_threshold(self.failure_rate_threshold)
            .with_min_sample_size(self.min_sample_size)
            .with_success_threshold(self.success_threshold)
            .with_open_timeout(Duration::from_millis(self.open_timeout_ms))
            .with_half_open_max_attempts(self.half_open_max_attempts)
            .with_adaptive_thresholds(self.adaptive_thresholds)
            .with_half_open_retry_after(Duration::from_millis(self.half_open_timeout_ms))
            .with_min_health_score(self.min_health_score)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_min_sample_size() -> u32 {
    10
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_timeout_ms() -> u64 {
    100
}

fn default_half_open_max_attempts() -> u32 {
    1
}

fn default_min_health_score() -> f64 {
    0.3
}

/// Idempotency engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencySection {
    /// Cached-outcome TTL, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Admission lock wait, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Poll interval while a duplicate waits on in-flight work, in
    /// milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Polls before giving up with `LockTimeout`.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
        }
    }
}

impl IdempotencySection {
    /// Convert to the engine config.
    pub fn to_engine_config(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
        }
    }
}

fn default_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_polls() -> u32 {
    50
}

/// Optimistic-lock retry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimisticLockSection {
    /// Reload-and-retry cycles after the first conflict.
    #[serde(default = "default_lock_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap on the computed delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Exponential multiplier.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter amplitude in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

impl Default for OptimisticLockSection {
    fn default() -> Self {
        Self {
            max_retries: default_lock_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_multiplier(),
            jitter_factor: default_jitter(),
        }
    }
}

impl OptimisticLockSection {
    /// Convert to the repository-layer config.
    pub fn to_lock_config(&self) -> OptimisticLockConfig {
        OptimisticLockConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

fn default_lock_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    500
}
