//! Read-modify-write over the versioned repository with bounded CAS retry.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::error::PaymentError;
use crate::domain::payment::{Payment, PaymentId};
use crate::resilience::{JitterSource, RetryConfig, ThreadRngJitter};

use super::{RepositoryError, VersionedRepository};

/// Backoff tuning for optimistic-lock retries, independent of the gateway
/// retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLockConfig {
    /// Maximum reload-and-retry cycles after the first conflict.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap on the computed delay.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter amplitude in [0, 1].
    pub jitter_factor: f64,
}

impl Default for OptimisticLockConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl OptimisticLockConfig {
    fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_multiplier(self.multiplier)
            .with_jitter_factor(self.jitter_factor)
    }
}

/// Applies pure mutations to stored payments, reloading and retrying when a
/// concurrent writer wins the version race.
pub struct VersionedPaymentService {
    repository: Arc<dyn VersionedRepository<Payment>>,
    config: OptimisticLockConfig,
    jitter: Arc<dyn JitterSource>,
}

impl VersionedPaymentService {
    /// Service over a repository with production jitter.
    pub fn new(
        repository: Arc<dyn VersionedRepository<Payment>>,
        config: OptimisticLockConfig,
    ) -> Self {
        Self {
            repository,
            config,
            jitter: Arc::new(ThreadRngJitter),
        }
    }

    /// Service with an injected jitter source for deterministic tests.
    pub fn with_jitter(
        repository: Arc<dyn VersionedRepository<Payment>>,
        config: OptimisticLockConfig,
        jitter: Arc<dyn JitterSource>,
    ) -> Self {
        Self {
            repository,
            config,
            jitter,
        }
    }

    /// The backing repository.
    pub fn repository(&self) -> &Arc<dyn VersionedRepository<Payment>> {
        &self.repository
    }

    /// Load, mutate, and CAS-commit a payment.
    ///
    /// `mutate` must be pure: it is re-invoked on a freshly loaded payment
    /// after every version conflict. Its own errors (e.g. an invalid
    /// transition against the reloaded state) propagate immediately.
    pub async fn update_with<F>(
        &self,
        id: &PaymentId,
        mutate: F,
    ) -> Result<Payment, PaymentError>
    where
        F: Fn(Payment) -> Result<Payment, PaymentError>,
    {
        let retry = self.config.to_retry_config();
        let mut attempt = 0u32;

        loop {
            let current = self
                .repository
                .find_by_id(id)
                .await?
                .ok_or_else(|| PaymentError::NotFound(id.to_string()))?;

            let next = mutate(current)?;

            match self.repository.update(next.clone()).await {
                Ok(()) => return Ok(next),
                Err(RepositoryError::Conflict {
                    id: conflict_id,
                    expected,
                    found,
                }) => {
                    if attempt >= self.config.max_retries {
                        return Err(PaymentError::OptimisticLockConflict {
                            id: conflict_id,
                            expected,
                            found,
                        });
                    }
                    let delay = retry.delay_for_attempt(attempt, self.jitter.as_ref());
                    tracing::debug!(
                        payment_id = %id,
                        attempt,
                        next_retry_in = ?delay,
                        "optimistic lock conflict, reloading"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::lifecycle::PaymentState;
    use crate::domain::money::{Currency, Money};
    use crate::domain::payment::{Customer, PaymentMethod};
    use crate::gateway::GatewayType;
    use crate::repository::InMemoryPaymentRepository;
    use crate::resilience::FixedJitter;

    fn sample_payment() -> Payment {
        Payment::new(
            "m1",
            "k1",
            Money::new(Decimal::new(5000, 2), Currency::USD).unwrap(),
            PaymentMethod::Wallet {
                provider: "payzapp".into(),
            },
            Customer::with_id("c1"),
            HashMap::new(),
        )
    }

    fn service(repository: Arc<dyn VersionedRepository<Payment>>) -> VersionedPaymentService {
        VersionedPaymentService::with_jitter(
            repository,
            OptimisticLockConfig {
                initial_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(FixedJitter(0.5)),
        )
    }

    #[tokio::test]
    async fn test_update_with_applies_transition() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let payment = sample_payment();
        repo.insert(payment.clone()).await.unwrap();

        let service = service(repo);
        let updated = service
            .update_with(&payment.id(), |p| p.authenticate(GatewayType::Stripe))
            .await
            .unwrap();

        assert_eq!(updated.state(), PaymentState::Authenticated);
        assert_eq!(updated.version(), 2);
    }

    #[tokio::test]
    async fn test_update_with_missing_payment() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let service = service(repo);
        let err = service
            .update_with(&PaymentId::new(), |p| Ok(p))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mutation_errors_propagate_without_retry() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let payment = sample_payment().mark_failure("declined").unwrap();
        let terminal = payment.clone();
        // Insert the terminal payment directly.
        repo.insert(terminal.clone()).await.unwrap();

        let service = service(repo);
        let err = service
            .update_with(&terminal.id(), |p| p.mark_success())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_linearized() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let payment = sample_payment();
        repo.insert(payment.clone()).await.unwrap();

        let service = Arc::new(service(repo.clone()));

        // Many concurrent metadata-free retries of the same transition chain:
        // each task advances whatever state it reloads.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = service.clone();
            let id = payment.id();
            handles.push(tokio::spawn(async move {
                service
                    .update_with(&id, |p| match p.state() {
                        PaymentState::Initiated => p.authenticate(GatewayType::Stripe),
                        PaymentState::Authenticated => p.start_processing("txn"),
                        PaymentState::Processing => p.mark_success(),
                        _ => Ok(p),
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = repo.find_by_id(&payment.id()).await.unwrap().unwrap();
        // Versions advanced one at a time; no committed version was shared.
        assert!(stored.version() >= 2);
        assert!(stored.version() <= 4);
    }

    #[tokio::test]
    async fn test_conflict_exhaustion_surfaces_optimistic_lock_error() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let payment = sample_payment();
        repo.insert(payment.clone()).await.unwrap();

        let service = VersionedPaymentService::with_jitter(
            repo.clone(),
            OptimisticLockConfig {
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(FixedJitter(0.5)),
        );

        // Mutation ignores the loaded state and always writes a stale version.
        let stale = payment.clone();
        let err = service
            .update_with(&payment.id(), move |_| {
                stale.clone().authenticate(GatewayType::Stripe)
            })
            .await;
        // First write succeeds (stored v1 -> v2)...
        assert!(err.is_ok());

        let stale_again = payment.clone();
        let err = service
            .update_with(&payment.id(), move |_| {
                stale_again.clone().authenticate(GatewayType::Stripe)
            })
            .await
            .unwrap_err();
        // ...the second insists on writing v2 over stored v2 and conflicts.
        assert!(matches!(err, PaymentError::OptimisticLockConflict { .. }));
    }
}
