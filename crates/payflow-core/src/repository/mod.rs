//! Versioned persistence with optimistic compare-and-swap updates.
//!
//! Every entity carries a monotonic version. `update` commits only when the
//! stored version is exactly `entity.version - 1`; concurrent writers are
//! linearized per aggregate — one winner per version, the loser reloads and
//! retries through [`VersionedPaymentService`].

mod service;

pub use service::{OptimisticLockConfig, VersionedPaymentService};

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::error::PaymentError;
use crate::domain::payment::{Payment, PaymentId};

/// Entities that carry an id and a monotonic version.
pub trait Versioned {
    /// Identifier type.
    type Id: Eq + std::hash::Hash + Clone + Send + Sync + std::fmt::Display;

    /// The entity's id.
    fn versioned_id(&self) -> Self::Id;

    /// The entity's current version.
    fn entity_version(&self) -> u64;
}

impl Versioned for Payment {
    type Id = PaymentId;

    fn versioned_id(&self) -> PaymentId {
        self.id()
    }

    fn entity_version(&self) -> u64 {
        self.version()
    }
}

/// Errors from versioned repositories.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Insert hit an existing id.
    #[error("entity '{id}' already exists")]
    Duplicate {
        /// Entity id.
        id: String,
    },

    /// The entity does not exist.
    #[error("entity '{id}' not found")]
    NotFound {
        /// Entity id.
        id: String,
    },

    /// The compare-and-swap found a different stored version.
    #[error("version conflict on '{id}': expected stored {expected}, found {found}")]
    Conflict {
        /// Entity id.
        id: String,
        /// Stored version the update expected.
        expected: u64,
        /// Stored version actually present.
        found: u64,
    },

    /// Backend failure.
    #[error("repository failure: {0}")]
    Storage(String),
}

impl From<RepositoryError> for PaymentError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Conflict {
                id,
                expected,
                found,
            } => PaymentError::OptimisticLockConflict {
                id,
                expected,
                found,
            },
            RepositoryError::NotFound { id } => PaymentError::NotFound(id),
            other => PaymentError::Internal(other.to_string()),
        }
    }
}

/// Port for versioned storage.
#[async_trait]
pub trait VersionedRepository<T: Versioned>: Send + Sync {
    /// Fetch an entity by id.
    async fn find_by_id(&self, id: &T::Id) -> Result<Option<T>, RepositoryError>;

    /// Insert a new entity; fails on duplicate id.
    async fn insert(&self, entity: T) -> Result<(), RepositoryError>;

    /// Compare-and-swap update: commits only when the stored version equals
    /// `entity.version - 1`.
    async fn update(&self, entity: T) -> Result<(), RepositoryError>;

    /// Every stored entity.
    async fn find_all(&self) -> Result<Vec<T>, RepositoryError>;
}

/// In-memory payment repository for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryPaymentRepository {
    payments: RwLock<HashMap<PaymentId, Payment>>,
}

impl InMemoryPaymentRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionedRepository<Payment> for InMemoryPaymentRepository {
    async fn find_by_id(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.payments.read().await.get(id).cloned())
    }

    async fn insert(&self, entity: Payment) -> Result<(), RepositoryError> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&entity.id()) {
            return Err(RepositoryError::Duplicate {
                id: entity.id().to_string(),
            });
        }
        payments.insert(entity.id(), entity);
        Ok(())
    }

    async fn update(&self, entity: Payment) -> Result<(), RepositoryError> {
        let mut payments = self.payments.write().await;
        let stored = payments
            .get(&entity.id())
            .ok_or_else(|| RepositoryError::NotFound {
                id: entity.id().to_string(),
            })?;

        let expected = entity.version().saturating_sub(1);
        if stored.version() != expected {
            return Err(RepositoryError::Conflict {
                id: entity.id().to_string(),
                expected,
                found: stored.version(),
            });
        }
        payments.insert(entity.id(), entity);
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<Payment>, RepositoryError> {
        let payments = self.payments.read().await;
        let mut all: Vec<Payment> = payments.values().cloned().collect();
        all.sort_by_key(|p| (p.created_at(), p.id()));
        Ok(all)
    }
}
