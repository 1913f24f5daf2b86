//! Per-gateway circuit breaker with health tracking and fast-fail.
//!
//! A breaker opens on sustained failure (consecutive count or rolling
//! failure rate), fast-fails while open, and probes recovery through a
//! bounded half-open state. Each breaker also maintains a health score — an
//! EWMA of recent success weighted against latency — which routing consumes
//! and which, when `adaptive_thresholds` is on, tightens the failure
//! threshold as health degrades.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::gateway::GatewayType;

/// EWMA smoothing factor for the health score.
const HEALTH_ALPHA: f64 = 0.2;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through normally.
    Closed,
    /// Requests fail immediately.
    Open,
    /// A bounded number of probes test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned when the circuit rejects a call.
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    /// The gateway whose circuit rejected the call.
    pub gateway: GatewayType,
    /// Time until the circuit may admit probes.
    pub retry_after: Duration,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circuit for '{}' is open, retry after {:?}",
            self.gateway, self.retry_after
        )
    }
}

impl std::error::Error for CircuitOpenError {}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Rolling failure rate that opens the circuit, in [0, 1].
    pub failure_rate_threshold: f64,
    /// Minimum rolling samples before the rate condition applies.
    pub min_sample_size: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Retry-after hint when half-open probe capacity is saturated.
    pub half_open_retry_after: Duration,
    /// Maximum concurrent probes while half-open.
    pub half_open_max_attempts: u32,
    /// Scale the failure threshold down as health degrades.
    pub adaptive_thresholds: bool,
    /// Floor for adaptive scaling; health below this scales no further.
    pub min_health_score: f64,
    /// Rolling outcome window size.
    pub window_size: usize,
    /// Latency considered "healthy" when weighting the health score.
    pub latency_target: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_sample_size: 10,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_retry_after: Duration::from_millis(100),
            half_open_max_attempts: 1,
            adaptive_thresholds: false,
            min_health_score: 0.3,
            window_size: 64,
            latency_target: Duration::from_millis(500),
        }
    }
}

impl CircuitBreakerConfig {
    /// Config with the given consecutive-failure threshold.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            ..Default::default()
        }
    }

    /// Set the rolling failure-rate threshold.
    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the minimum sample size for the rate condition.
    pub fn with_min_sample_size(mut self, samples: u32) -> Self {
        self.min_sample_size = samples;
        self
    }

    /// Set the consecutive successes required to close from half-open.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set how long the circuit stays open before probing.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the number of concurrent half-open probes.
    pub fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts.max(1);
        self
    }

    /// Enable adaptive threshold scaling.
    pub fn with_adaptive_thresholds(mut self, enabled: bool) -> Self {
        self.adaptive_thresholds = enabled;
        self
    }

    /// Set the retry-after hint for saturated half-open capacity.
    pub fn with_half_open_retry_after(mut self, retry_after: Duration) -> Self {
        self.half_open_retry_after = retry_after;
        self
    }

    /// Set the adaptive-scaling floor.
    pub fn with_min_health_score(mut self, floor: f64) -> Self {
        self.min_health_score = floor.clamp(0.0, 1.0);
        self
    }
}

/// Published health snapshot for one gateway's circuit.
#[derive(Debug, Clone)]
pub struct CircuitHealth {
    /// Current circuit state.
    pub state: CircuitState,
    /// EWMA health score in [0, 1].
    pub health_score: f64,
    /// Success rate over the rolling window.
    pub success_rate: f64,
    /// Current consecutive successes.
    pub consecutive_successes: u32,
    /// Current consecutive failures.
    pub consecutive_failures: u32,
    /// How many times the circuit has opened.
    pub open_count: u32,
    /// Lifetime successes.
    pub total_successes: u64,
    /// Lifetime failures.
    pub total_failures: u64,
}

/// Circuit breaker for a single gateway.
pub struct CircuitBreaker {
    gateway: GatewayType,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    state_changed_at: RwLock<Instant>,
    /// Rolling outcomes, newest at the back.
    window: Mutex<VecDeque<bool>>,
    health: Mutex<f64>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_in_flight: AtomicU32,
    open_count: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker for a gateway.
    pub fn new(gateway: GatewayType, config: CircuitBreakerConfig) -> Self {
        Self {
            gateway,
            config,
            state: RwLock::new(CircuitState::Closed),
            state_changed_at: RwLock::new(Instant::now()),
            window: Mutex::new(VecDeque::new()),
            health: Mutex::new(1.0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            open_count: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// The gateway this breaker guards.
    pub fn gateway(&self) -> GatewayType {
        self.gateway
    }

    /// Check whether a request may proceed.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        self.maybe_transition_to_half_open();

        let state = *self.state.read();
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                let elapsed = self.state_changed_at.read().elapsed();
                Err(CircuitOpenError {
                    gateway: self.gateway,
                    retry_after: self.config.open_timeout.saturating_sub(elapsed),
                })
            }
            CircuitState::HalfOpen => {
                let in_flight = self.half_open_in_flight.load(Ordering::Acquire);
                if in_flight < self.config.half_open_max_attempts {
                    self.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                } else {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitOpenError {
                        gateway: self.gateway,
                        retry_after: self.config.half_open_retry_after,
                    })
                }
            }
        }
    }

    /// Record a successful call and its latency.
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        self.push_outcome(true);
        self.update_health(true, latency);

        let state = *self.state.read();
        if state == CircuitState::HalfOpen {
            self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition_to(CircuitState::Closed);
            }
        }
    }

    /// Record a failed call and its latency.
    pub fn record_failure(&self, latency: Duration) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.push_outcome(false);
        self.update_health(false, latency);

        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                if consecutive >= self.effective_failure_threshold() || self.failure_rate_tripped()
                {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
                // Single probe failure reopens the circuit.
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Execute an async operation through the breaker, timing it.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check().map_err(CircuitBreakerError::CircuitOpen)?;

        let start = Instant::now();
        match f().await {
            Ok(value) => {
                self.record_success(start.elapsed());
                Ok(value)
            }
            Err(error) => {
                self.record_failure(start.elapsed());
                Err(CircuitBreakerError::Inner(error))
            }
        }
    }

    /// The current state, advancing open -> half-open when due.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        *self.state.read()
    }

    /// Publish the health snapshot.
    pub fn health(&self) -> CircuitHealth {
        self.maybe_transition_to_half_open();

        let window = self.window.lock();
        let success_rate = if window.is_empty() {
            1.0
        } else {
            window.iter().filter(|&&ok| ok).count() as f64 / window.len() as f64
        };
        drop(window);

        CircuitHealth {
            state: *self.state.read(),
            health_score: *self.health.lock(),
            success_rate,
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            total_successes: self.success_count.load(Ordering::Relaxed),
            total_failures: self.failure_count.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker back to closed, clearing counters.
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
        self.window.lock().clear();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        *self.health.lock() = 1.0;
    }

    /// The failure threshold currently in effect. With adaptive thresholds
    /// the configured value is scaled by the health score (floored at
    /// `min_health_score`), so a degraded gateway opens sooner.
    pub fn effective_failure_threshold(&self) -> u32 {
        if !self.config.adaptive_thresholds {
            return self.config.failure_threshold;
        }
        let scale = self.health.lock().max(self.config.min_health_score);
        ((self.config.failure_threshold as f64 * scale).round() as u32).max(1)
    }

    fn failure_rate_tripped(&self) -> bool {
        let window = self.window.lock();
        if (window.len() as u32) < self.config.min_sample_size {
            return false;
        }
        let failures = window.iter().filter(|&&ok| !ok).count() as f64;
        failures / window.len() as f64 >= self.config.failure_rate_threshold
    }

    fn push_outcome(&self, success: bool) {
        let mut window = self.window.lock();
        if window.len() == self.config.window_size {
            window.pop_front();
        }
        window.push_back(success);
    }

    fn update_health(&self, success: bool, latency: Duration) {
        let sample = if success {
            let target = self.config.latency_target.as_secs_f64();
            target / (target + latency.as_secs_f64())
        } else {
            0.0
        };
        let mut health = self.health.lock();
        *health = HEALTH_ALPHA * sample + (1.0 - HEALTH_ALPHA) * *health;
    }

    fn transition_to(&self, new_state: CircuitState) {
        let mut state = self.state.write();
        let old_state = *state;

        if old_state != new_state {
            *state = new_state;
            *self.state_changed_at.write() = Instant::now();

            if new_state == CircuitState::Open {
                self.open_count.fetch_add(1, Ordering::Relaxed);
            }
            if new_state == CircuitState::HalfOpen || new_state == CircuitState::Closed {
                self.half_open_successes.store(0, Ordering::Relaxed);
                self.half_open_in_flight.store(0, Ordering::Relaxed);
            }
            if new_state == CircuitState::Closed {
                self.window.lock().clear();
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }

            tracing::info!(
                gateway = %self.gateway,
                old_state = %old_state,
                new_state = %new_state,
                "circuit breaker state changed"
            );
        }
    }

    fn maybe_transition_to_half_open(&self) {
        let state = *self.state.read();
        if state == CircuitState::Open {
            let elapsed = self.state_changed_at.read().elapsed();
            if elapsed >= self.config.open_timeout {
                self.transition_to(CircuitState::HalfOpen);
            }
        }
    }
}

/// Error type for calls routed through a breaker.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit rejected the call.
    CircuitOpen(CircuitOpenError),
    /// The inner operation failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen(e) => write!(f, "{}", e),
            CircuitBreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::CircuitOpen(e) => Some(e),
            CircuitBreakerError::Inner(e) => Some(e),
        }
    }
}

/// Per-orchestrator registry of gateway breakers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<GatewayType, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Registry handing out breakers with the given default config.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get or create the breaker for a gateway.
    pub fn get_or_create(&self, gateway: GatewayType) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(gateway)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(gateway, self.default_config.clone()))
            })
            .clone()
    }

    /// Look up an existing breaker.
    pub fn get(&self, gateway: GatewayType) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&gateway).map(|b| b.clone())
    }

    /// Health snapshots for every breaker, sorted by gateway name.
    pub fn all_health(&self) -> Vec<(GatewayType, CircuitHealth)> {
        let mut all: Vec<(GatewayType, CircuitHealth)> = self
            .breakers
            .iter()
            .map(|entry| (*entry.key(), entry.value().health()))
            .collect();
        all.sort_by_key(|(g, _)| g.name());
        all
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
