//! Weighted gateway selection over live metrics and breaker health.
//!
//! Each candidate scores
//! `w_success * success_rate + w_latency * (1 - norm_latency) +
//!  w_cost * (1 - norm_cost) + w_health * health_score`;
//! gateways with an open circuit score zero, candidates without enough
//! samples get a neutral prior, and ties break deterministically by gateway
//! name. The decision records the inputs that drove it so it can be
//! explained in logs and tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::PaymentError;
use crate::domain::payment::Payment;
use crate::gateway::{GatewayMetrics, GatewayType};
use crate::resilience::{CircuitHealth, CircuitState};

/// Neutral prior used for metric-derived terms until a gateway has enough
/// observed outcomes.
pub const NEUTRAL_PRIOR: f64 = 0.5;

/// Scoring weights. Must be non-negative and sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingWeights {
    /// Weight of the rolling success rate.
    pub success: f64,
    /// Weight of the (inverted, normalized) latency.
    pub latency: f64,
    /// Weight of the (inverted, normalized) cost.
    pub cost: f64,
    /// Weight of the breaker health score.
    pub health: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        // Defaults favor success rate.
        Self {
            success: 0.4,
            latency: 0.25,
            cost: 0.15,
            health: 0.2,
        }
    }
}

impl RoutingWeights {
    /// Validate non-negativity and unit sum (within float tolerance).
    pub fn validate(&self) -> Result<(), PaymentError> {
        let parts = [self.success, self.latency, self.cost, self.health];
        if parts.iter().any(|w| *w < 0.0) {
            return Err(PaymentError::Validation(
                "routing weights must be non-negative".to_string(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PaymentError::Validation(format!(
                "routing weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Per-candidate scoring breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayScore {
    /// The candidate.
    pub gateway: GatewayType,
    /// Final weighted score (zero when the circuit is open).
    pub score: f64,
    /// Success term fed into the score.
    pub success_term: f64,
    /// Latency term fed into the score.
    pub latency_term: f64,
    /// Cost term fed into the score.
    pub cost_term: f64,
    /// Health term fed into the score.
    pub health_term: f64,
    /// Whether the candidate's circuit was open.
    pub open: bool,
}

/// The routing outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Selected gateway.
    pub gateway: GatewayType,
    /// Its score.
    pub score: f64,
    /// Human-readable explanation of the choice.
    pub reason: String,
    /// Every candidate's breakdown, sorted by gateway name.
    pub breakdown: Vec<GatewayScore>,
}

/// Errors from gateway selection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No gateway was offered.
    #[error("no gateway candidates")]
    NoCandidates,

    /// Every candidate's circuit is open.
    #[error("all gateway circuits are open")]
    AllUnavailable {
        /// The candidates that were considered.
        candidates: Vec<GatewayType>,
    },
}

/// The weighted-scoring routing engine.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    weights: RoutingWeights,
    min_samples: u32,
}

impl RoutingEngine {
    /// Engine with the given weights and sample floor.
    pub fn new(weights: RoutingWeights, min_samples: u32) -> Self {
        Self {
            weights,
            min_samples,
        }
    }

    /// The weights in effect.
    pub fn weights(&self) -> &RoutingWeights {
        &self.weights
    }

    /// Score every candidate and pick the best available gateway.
    pub fn select(
        &self,
        payment: &Payment,
        candidates: &[GatewayType],
        metrics: &HashMap<GatewayType, GatewayMetrics>,
        health: &HashMap<GatewayType, CircuitHealth>,
    ) -> Result<RoutingDecision, RoutingError> {
        if candidates.is_empty() {
            return Err(RoutingError::NoCandidates);
        }

        let mut sorted: Vec<GatewayType> = candidates.to_vec();
        sorted.sort_by_key(|g| g.name());
        sorted.dedup();

        // Normalization baselines over candidates with usable metrics.
        let max_latency = sorted
            .iter()
            .filter_map(|g| metrics.get(g))
            .filter(|m| m.sample_count as u32 >= self.min_samples)
            .map(|m| m.avg_latency.as_secs_f64())
            .fold(0.0_f64, f64::max);
        let max_cost = sorted
            .iter()
            .filter_map(|g| metrics.get(g))
            .map(|m| m.cost_per_transaction)
            .fold(0.0_f64, f64::max);

        let breakdown: Vec<GatewayScore> = sorted
            .iter()
            .map(|&gateway| {
                self.score_candidate(gateway, metrics, health, max_latency, max_cost)
            })
            .collect();

        // Strictly-greater comparison over the name-sorted list makes the
        // alphabetically first gateway win exact ties.
        let winner = breakdown
            .iter()
            .filter(|s| !s.open)
            .fold(None::<&GatewayScore>, |best, candidate| match best {
                Some(current) if current.score >= candidate.score => Some(current),
                _ => Some(candidate),
            });

        match winner {
            Some(best) => {
                let reason = format!(
                    "selected {} for payment {} (score {:.3}: success {:.2}, latency {:.2}, cost {:.2}, health {:.2})",
                    best.gateway,
                    payment.id(),
                    best.score,
                    best.success_term,
                    best.latency_term,
                    best.cost_term,
                    best.health_term,
                );
                tracing::debug!(
                    gateway = %best.gateway,
                    score = best.score,
                    payment_id = %payment.id(),
                    "routing decision"
                );
                Ok(RoutingDecision {
                    gateway: best.gateway,
                    score: best.score,
                    reason,
                    breakdown,
                })
            }
            None => Err(RoutingError::AllUnavailable { candidates: sorted }),
        }
    }

    fn score_candidate(
        &self,
        gateway: GatewayType,
        metrics: &HashMap<GatewayType, GatewayMetrics>,
        health: &HashMap<GatewayType, CircuitHealth>,
        max_latency: f64,
        max_cost: f64,
    ) -> GatewayScore {
        let circuit = health.get(&gateway);
        let open = circuit
            .map(|h| h.state == CircuitState::Open)
            .unwrap_or(false);
        let health_term = circuit.map(|h| h.health_score).unwrap_or(1.0);

        let gateway_metrics = metrics.get(&gateway);

        let (success_term, latency_term) = match gateway_metrics {
            Some(m) if m.sample_count as u32 >= self.min_samples => {
                let normalized_latency = if max_latency > 0.0 {
                    (m.avg_latency.as_secs_f64() / max_latency).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                (m.success_rate, 1.0 - normalized_latency)
            }
            _ => (NEUTRAL_PRIOR, NEUTRAL_PRIOR),
        };

        let cost_term = match gateway_metrics {
            Some(m) if max_cost > 0.0 => 1.0 - (m.cost_per_transaction / max_cost).clamp(0.0, 1.0),
            Some(_) => 1.0,
            None => NEUTRAL_PRIOR,
        };

        let score = if open {
            0.0
        } else {
            self.weights.success * success_term
                + self.weights.latency * latency_term
                + self.weights.cost * cost_term
                + self.weights.health * health_term
        };

        GatewayScore {
            gateway,
            score,
            success_term,
            latency_term,
            cost_term,
            health_term,
            open,
        }
    }
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new(RoutingWeights::default(), 10)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::money::{Currency, Money};
    use crate::domain::payment::{Customer, PaymentMethod};
    use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

    fn sample_payment() -> Payment {
        Payment::new(
            "m1",
            "k1",
            Money::new(Decimal::new(10000, 2), Currency::USD).unwrap(),
            PaymentMethod::Card {
                token: "tok".into(),
                last_four: "4242".into(),
                network: "visa".into(),
            },
            Customer::with_id("c1"),
            StdHashMap::new(),
        )
    }

    fn metrics_for(
        gateway: GatewayType,
        success_rate: f64,
        avg_latency_ms: u64,
        cost: f64,
        samples: usize,
    ) -> GatewayMetrics {
        GatewayMetrics {
            gateway,
            success_count: 0,
            failure_count: 0,
            success_rate,
            avg_latency: Duration::from_millis(avg_latency_ms),
            p95_latency: Duration::from_millis(avg_latency_ms * 2),
            cost_per_transaction: cost,
            sample_count: samples,
        }
    }

    fn health_for(gateway: GatewayType, failures: u32) -> CircuitHealth {
        let breaker = CircuitBreaker::new(gateway, CircuitBreakerConfig::new(failures.max(1)));
        for _ in 0..failures {
            breaker.record_failure(Duration::from_millis(10));
        }
        breaker.health()
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        RoutingWeights::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let weights = RoutingWeights {
            success: 0.9,
            latency: 0.9,
            cost: 0.0,
            health: 0.0,
        };
        assert!(weights.validate().is_err());

        let negative = RoutingWeights {
            success: -0.5,
            latency: 0.5,
            cost: 0.5,
            health: 0.5,
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_no_candidates_errors() {
        let engine = RoutingEngine::default();
        let err = engine
            .select(
                &sample_payment(),
                &[],
                &StdHashMap::new(),
                &StdHashMap::new(),
            )
            .unwrap_err();
        assert_eq!(err, RoutingError::NoCandidates);
    }

    #[test]
    fn test_higher_success_rate_wins() {
        let engine = RoutingEngine::default();
        let mut metrics = StdHashMap::new();
        metrics.insert(
            GatewayType::Stripe,
            metrics_for(GatewayType::Stripe, 0.99, 100, 0.3, 50),
        );
        metrics.insert(
            GatewayType::Paypal,
            metrics_for(GatewayType::Paypal, 0.70, 100, 0.3, 50),
        );
        let mut health = StdHashMap::new();
        health.insert(GatewayType::Stripe, health_for(GatewayType::Stripe, 0));
        health.insert(GatewayType::Paypal, health_for(GatewayType::Paypal, 0));

        let decision = engine
            .select(
                &sample_payment(),
                &[GatewayType::Paypal, GatewayType::Stripe],
                &metrics,
                &health,
            )
            .unwrap();
        assert_eq!(decision.gateway, GatewayType::Stripe);
        assert!(decision.reason.contains("stripe"));
        assert_eq!(decision.breakdown.len(), 2);
    }

    #[test]
    fn test_open_circuit_scores_zero_and_loses() {
        let engine = RoutingEngine::default();
        let mut metrics = StdHashMap::new();
        metrics.insert(
            GatewayType::Stripe,
            metrics_for(GatewayType::Stripe, 1.0, 50, 0.3, 50),
        );
        metrics.insert(
            GatewayType::Paypal,
            metrics_for(GatewayType::Paypal, 0.6, 400, 0.5, 50),
        );

        let mut health = StdHashMap::new();
        // Trip stripe's breaker.
        health.insert(GatewayType::Stripe, health_for(GatewayType::Stripe, 5));
        health.insert(GatewayType::Paypal, health_for(GatewayType::Paypal, 0));

        let decision = engine
            .select(
                &sample_payment(),
                &[GatewayType::Stripe, GatewayType::Paypal],
                &metrics,
                &health,
            )
            .unwrap();
        assert_eq!(decision.gateway, GatewayType::Paypal);

        let stripe_score = decision
            .breakdown
            .iter()
            .find(|s| s.gateway == GatewayType::Stripe)
            .unwrap();
        assert!(stripe_score.open);
        assert_eq!(stripe_score.score, 0.0);
    }

    #[test]
    fn test_all_open_is_unavailable() {
        let engine = RoutingEngine::default();
        let mut health = StdHashMap::new();
        health.insert(GatewayType::Stripe, health_for(GatewayType::Stripe, 5));

        let err = engine
            .select(
                &sample_payment(),
                &[GatewayType::Stripe],
                &StdHashMap::new(),
                &health,
            )
            .unwrap_err();
        assert!(matches!(err, RoutingError::AllUnavailable { .. }));
    }

    #[test]
    fn test_cold_gateways_get_neutral_prior() {
        let engine = RoutingEngine::new(RoutingWeights::default(), 10);
        let mut metrics = StdHashMap::new();
        // Below min_samples: metrics exist but are not trusted yet.
        metrics.insert(
            GatewayType::Stripe,
            metrics_for(GatewayType::Stripe, 0.0, 10_000, 0.3, 3),
        );

        let decision = engine
            .select(
                &sample_payment(),
                &[GatewayType::Stripe],
                &metrics,
                &StdHashMap::new(),
            )
            .unwrap();
        let score = &decision.breakdown[0];
        assert_eq!(score.success_term, NEUTRAL_PRIOR);
        assert_eq!(score.latency_term, NEUTRAL_PRIOR);
    }

    #[test]
    fn test_exact_tie_breaks_by_name() {
        let engine = RoutingEngine::default();
        // No metrics, no health: identical neutral scores everywhere.
        let decision = engine
            .select(
                &sample_payment(),
                &[GatewayType::Stripe, GatewayType::Adyen, GatewayType::Paypal],
                &StdHashMap::new(),
                &StdHashMap::new(),
            )
            .unwrap();
        assert_eq!(decision.gateway, GatewayType::Adyen);
    }

    #[test]
    fn test_cheaper_gateway_wins_on_cost_term() {
        let weights = RoutingWeights {
            success: 0.0,
            latency: 0.0,
            cost: 1.0,
            health: 0.0,
        };
        let engine = RoutingEngine::new(weights, 10);

        let mut metrics = StdHashMap::new();
        metrics.insert(
            GatewayType::Stripe,
            metrics_for(GatewayType::Stripe, 0.9, 100, 0.9, 50),
        );
        metrics.insert(
            GatewayType::Razorpay,
            metrics_for(GatewayType::Razorpay, 0.9, 100, 0.2, 50),
        );

        let decision = engine
            .select(
                &sample_payment(),
                &[GatewayType::Stripe, GatewayType::Razorpay],
                &metrics,
                &StdHashMap::new(),
            )
            .unwrap();
        assert_eq!(decision.gateway, GatewayType::Razorpay);
    }
}
