//! Crash recovery: drive interrupted payments to a definite terminal state.
//!
//! On boot the coordinator enumerates aggregates whose latest event is
//! non-terminal. A payment interrupted while `Processing` is reconciled with
//! the gateway's own record via `get_status`; a payment interrupted earlier
//! never completed a charge, so it fails safe. Either way the stream ends
//! contiguous and terminal.

use std::sync::Arc;

use crate::domain::error::PaymentError;
use crate::domain::events::PaymentEvent;
use crate::domain::lifecycle::PaymentState;
use crate::domain::payment::{Payment, PaymentId};
use crate::eventstore::{EventStore, SourcingCoordinator};
use crate::gateway::{GatewayPaymentStatus, GatewayRegistry};
use crate::repository::{RepositoryError, VersionedRepository};

/// What a recovery sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-terminal aggregates examined.
    pub scanned: usize,
    /// Streams completed as SUCCESS after gateway confirmation.
    pub recovered_success: usize,
    /// Streams completed as FAILURE.
    pub recovered_failure: usize,
    /// Aggregates left alone (gateway still pending, or reconciliation
    /// failed); they will be retried by the next sweep.
    pub skipped: Vec<PaymentId>,
}

enum Reconciliation {
    Succeeded,
    Failed,
    StillPending,
}

/// Reconciles interrupted payments against gateway truth.
pub struct RecoveryCoordinator {
    events: Arc<dyn EventStore>,
    repository: Arc<dyn VersionedRepository<Payment>>,
    gateways: Arc<GatewayRegistry>,
}

impl RecoveryCoordinator {
    /// Coordinator over the orchestrator's ports.
    pub fn new(
        events: Arc<dyn EventStore>,
        repository: Arc<dyn VersionedRepository<Payment>>,
        gateways: Arc<GatewayRegistry>,
    ) -> Self {
        Self {
            events,
            repository,
            gateways,
        }
    }

    /// Run one recovery sweep.
    pub async fn recover(&self) -> Result<RecoveryReport, PaymentError> {
        let sourcing = SourcingCoordinator::new(self.events.clone());
        let pending = sourcing.non_terminal_aggregates().await?;

        let mut report = RecoveryReport {
            scanned: pending.len(),
            ..Default::default()
        };

        for aggregate_id in pending {
            match self.reconcile(&sourcing, aggregate_id).await {
                Ok(Reconciliation::Succeeded) => report.recovered_success += 1,
                Ok(Reconciliation::Failed) => report.recovered_failure += 1,
                Ok(Reconciliation::StillPending) => report.skipped.push(aggregate_id),
                Err(error) => {
                    tracing::warn!(
                        payment_id = %aggregate_id,
                        error = %error,
                        "recovery reconciliation failed, leaving for next sweep"
                    );
                    report.skipped.push(aggregate_id);
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            recovered_success = report.recovered_success,
            recovered_failure = report.recovered_failure,
            skipped = report.skipped.len(),
            "crash recovery sweep complete"
        );
        Ok(report)
    }

    async fn reconcile(
        &self,
        sourcing: &SourcingCoordinator<dyn EventStore>,
        aggregate_id: PaymentId,
    ) -> Result<Reconciliation, PaymentError> {
        let payment = sourcing.load(&aggregate_id).await?;

        match payment.state() {
            PaymentState::Processing => self.reconcile_with_gateway(payment).await,
            PaymentState::Initiated | PaymentState::Authenticated => {
                // No charge was completed; fail safe so the caller can retry.
                let failed = payment
                    .mark_failure("interrupted before gateway processing completed")?;
                self.commit_terminal(&failed, true).await?;
                Ok(Reconciliation::Failed)
            }
            PaymentState::Success | PaymentState::Failure => Ok(Reconciliation::StillPending),
        }
    }

    async fn reconcile_with_gateway(
        &self,
        payment: Payment,
    ) -> Result<Reconciliation, PaymentError> {
        let gateway_type = payment.gateway_type().ok_or_else(|| {
            PaymentError::EventContinuity {
                aggregate_id: payment.id().to_string(),
                detail: "processing payment without a gateway".to_string(),
            }
        })?;
        let transaction_id = payment
            .gateway_transaction_id()
            .ok_or_else(|| PaymentError::EventContinuity {
                aggregate_id: payment.id().to_string(),
                detail: "processing payment without a gateway transaction id".to_string(),
            })?
            .to_string();

        let registered = self.gateways.get(gateway_type).ok_or_else(|| {
            PaymentError::Validation(format!(
                "gateway '{gateway_type}' not registered for reconciliation"
            ))
        })?;

        match registered.gateway.get_status(&transaction_id).await? {
            GatewayPaymentStatus::Succeeded => {
                let succeeded = payment.mark_success()?;
                self.commit_terminal(&succeeded, false).await?;
                tracing::info!(
                    payment_id = %succeeded.id(),
                    gateway = %gateway_type,
                    "recovered payment as SUCCESS from gateway record"
                );
                Ok(Reconciliation::Succeeded)
            }
            GatewayPaymentStatus::Failed => {
                let failed =
                    payment.mark_failure("gateway reported failure during reconciliation")?;
                self.commit_terminal(&failed, true).await?;
                Ok(Reconciliation::Failed)
            }
            GatewayPaymentStatus::Pending => Ok(Reconciliation::StillPending),
        }
    }

    async fn commit_terminal(
        &self,
        payment: &Payment,
        failed: bool,
    ) -> Result<(), PaymentError> {
        let event = if failed {
            PaymentEvent::failed(payment, false)
        } else {
            PaymentEvent::succeeded(payment)
        };
        self.events.append(vec![event]).await?;

        // The repository may be behind the stream (crash between append and
        // persist) or missing the row entirely.
        match self.repository.update(payment.clone()).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::NotFound { .. }) => {
                Ok(self.repository.insert(payment.clone()).await?)
            }
            Err(RepositoryError::Conflict { found, .. }) if found >= payment.version() => {
                // Another recoverer already committed this or a later state.
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }
}
