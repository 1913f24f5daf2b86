//! Named mutual-exclusion leases with TTL.
//!
//! The idempotency engine serializes admissions per scoped key through this
//! port. Leases auto-expire at their TTL so a crashed holder can never wedge
//! a key forever; release and extend are fenced by a per-lease token so a
//! stale holder cannot release a lock someone else has since acquired.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::error::PaymentError;

/// How often a waiting acquirer re-checks a held lock.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A held lease on a named lock.
#[derive(Debug, Clone)]
pub struct LockLease {
    /// The lock name.
    pub name: String,
    /// Fencing token; only the matching holder may release or extend.
    token: Uuid,
    /// When the lease was granted.
    pub acquired_at: Instant,
    /// Time-to-live from `acquired_at`.
    pub ttl: Duration,
}

impl LockLease {
    /// Time left before the lease auto-expires.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }

    /// Whether the lease has auto-expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Errors from lock operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock stayed held past the acquire deadline.
    #[error("timed out acquiring lock '{name}'")]
    AcquireTimeout {
        /// Lock name.
        name: String,
    },

    /// The lease is no longer the current holder (expired and re-granted).
    #[error("lease on '{name}' is not held")]
    NotHeld {
        /// Lock name.
        name: String,
    },
}

impl From<LockError> for PaymentError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::AcquireTimeout { name } => PaymentError::LockTimeout { name },
            LockError::NotHeld { name } => {
                PaymentError::Internal(format!("stale lock lease on '{name}'"))
            }
        }
    }
}

/// Port for named mutual-exclusion leases.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire `name`, waiting up to `wait_timeout` for the current holder.
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<LockLease, LockError>;

    /// Release a held lease. Fails with `NotHeld` if the lease expired and
    /// the lock was re-granted.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;

    /// Extend a held lease by a fresh TTL.
    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError>;
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: Uuid,
    expires_at: Instant,
}

/// Process-local lock manager. Serializable read-then-insert semantics come
/// from the single map entry per name.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: DashMap<String, Holder>,
}

impl InMemoryLockManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, name: &str, ttl: Duration) -> Option<LockLease> {
        let now = Instant::now();
        let token = Uuid::new_v4();
        let holder = Holder {
            token,
            expires_at: now + ttl,
        };

        let granted = match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(holder);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
                true
            }
        };

        granted.then(|| LockLease {
            name: name.to_string(),
            token,
            acquired_at: now,
            ttl,
        })
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<LockLease, LockError> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(lease) = self.try_acquire(name, ttl) {
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                return Err(LockError::AcquireTimeout {
                    name: name.to_string(),
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let removed = self
            .locks
            .remove_if(&lease.name, |_, holder| holder.token == lease.token);
        if removed.is_some() {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                name: lease.name.clone(),
            })
        }
    }

    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<LockLease, LockError> {
        let now = Instant::now();
        match self.locks.get_mut(&lease.name) {
            Some(mut holder) if holder.token == lease.token && holder.expires_at > now => {
                holder.expires_at = now + ttl;
                Ok(LockLease {
                    name: lease.name.clone(),
                    token: lease.token,
                    acquired_at: now,
                    ttl,
                })
            }
            _ => Err(LockError::NotHeld {
                name: lease.name.clone(),
            }),
        }
    }
}
