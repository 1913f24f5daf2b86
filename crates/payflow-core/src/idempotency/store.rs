//! Idempotency record storage.
//!
//! The store only ever holds a request's fingerprint and its cached outcome
//! — the raw request body is never persisted. In-memory records expire both
//! lazily (an expired record read through `get` is dropped and reported
//! missing) and through the `expire_before` sweep; both views key off
//! `expires_at`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::error::{ErrorRecord, PaymentError};

/// Lifecycle of a cached admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    /// Work is in flight; duplicates poll for the terminal outcome.
    Processing,
    /// Work finished successfully; the result is cached.
    Completed,
    /// Work failed terminally; the error is cached.
    Failed,
}

/// One cached admission, keyed by scoped key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// `{merchant}:{operation}:{callerKey}`.
    pub scoped_key: String,
    /// Canonical-request fingerprint.
    pub fingerprint: String,
    /// Record status.
    pub status: IdempotencyStatus,
    /// Cached result when `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Cached error when `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record stops being served.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A fresh in-flight record.
    pub fn processing(
        scoped_key: impl Into<String>,
        fingerprint: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            scoped_key: scoped_key.into(),
            fingerprint: fingerprint.into(),
            status: IdempotencyStatus::Processing,
            result: None,
            error: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// This record, settled as completed with a cached result.
    pub fn completed(mut self, result: Value) -> Self {
        self.status = IdempotencyStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self
    }

    /// This record, settled as failed with a cached error.
    pub fn failed(mut self, error: ErrorRecord) -> Self {
        self.status = IdempotencyStatus::Failed;
        self.error = Some(error);
        self.result = None;
        self
    }

    /// Whether the record has settled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            IdempotencyStatus::Completed | IdempotencyStatus::Failed
        )
    }

    /// Whether the record is past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Errors from the idempotency store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStoreError {
    /// A `put` hit an existing record for the same scoped key.
    #[error("record already exists for '{scoped_key}'")]
    AlreadyExists {
        /// The scoped key.
        scoped_key: String,
    },

    /// A `cas` found a record whose status did not match the expectation.
    #[error("status conflict on '{scoped_key}': expected {expected:?}")]
    StatusConflict {
        /// The scoped key.
        scoped_key: String,
        /// Status the caller expected.
        expected: IdempotencyStatus,
    },

    /// Backend failure.
    #[error("idempotency store failure: {0}")]
    Storage(String),
}

impl From<IdempotencyStoreError> for PaymentError {
    fn from(error: IdempotencyStoreError) -> Self {
        PaymentError::Internal(error.to_string())
    }
}

/// Port for idempotency record storage. Implementations must make
/// read-then-insert atomic per scoped key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the record for a scoped key, if present and unexpired.
    async fn get(&self, scoped_key: &str)
        -> Result<Option<IdempotencyRecord>, IdempotencyStoreError>;

    /// Insert a new record; fails if one already exists.
    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyStoreError>;

    /// Replace the record, guarded by its current status.
    async fn cas(
        &self,
        record: IdempotencyRecord,
        expected: IdempotencyStatus,
    ) -> Result<(), IdempotencyStoreError>;

    /// Remove a record.
    async fn delete(&self, scoped_key: &str) -> Result<(), IdempotencyStoreError>;

    /// Remove every record expiring at or before the cutoff; returns how
    /// many were removed.
    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyStoreError>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records (expired ones included until swept).
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(
        &self,
        scoped_key: &str,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        match records.get(scoped_key) {
            Some(record) if record.is_expired(now) => {
                records.remove(scoped_key);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<(), IdempotencyStoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.scoped_key) {
            if !existing.is_expired(now) {
                return Err(IdempotencyStoreError::AlreadyExists {
                    scoped_key: record.scoped_key,
                });
            }
        }
        records.insert(record.scoped_key.clone(), record);
        Ok(())
    }

    async fn cas(
        &self,
        record: IdempotencyRecord,
        expected: IdempotencyStatus,
    ) -> Result<(), IdempotencyStoreError> {
        let mut records = self.records.write().await;
        match records.get(&record.scoped_key) {
            Some(existing) if existing.status == expected => {
                records.insert(record.scoped_key.clone(), record);
                Ok(())
            }
            _ => Err(IdempotencyStoreError::StatusConflict {
                scoped_key: record.scoped_key,
                expected,
            }),
        }
    }

    async fn delete(&self, scoped_key: &str) -> Result<(), IdempotencyStoreError> {
        self.records.write().await.remove(scoped_key);
        Ok(())
    }

    async fn expire_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, IdempotencyStoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > cutoff);
        Ok(before - records.len())
    }
}
