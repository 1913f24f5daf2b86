//! Exactly-once admission keyed by `{merchant}:{operation}:{callerKey}`.
//!
//! For a given scoped key and identical request fingerprint, the wrapped
//! work function runs at most once across concurrent callers and process
//! restarts (given a durable, globally visible store and lock manager).
//! Reusing a key with a different body is a hard [`PaymentError::FingerprintMismatch`]
//! — never a silent re-run. Failed outcomes are cached too, so a declined
//! charge cannot be retried into a retry storm under the same key.

mod fingerprint;
mod store;

pub use fingerprint::{canonicalize, fingerprint, VOLATILE_FIELDS};
pub use store::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, IdempotencyStoreError,
    InMemoryIdempotencyStore,
};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::error::PaymentError;
use crate::lock::LockManager;

/// Identifies one idempotent operation instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyScope {
    /// Owning merchant.
    pub merchant_id: String,
    /// Logical operation name (`create_payment`, `retry_payment#1`, ...).
    pub operation: String,
    /// Caller-supplied idempotency key.
    pub caller_key: String,
}

impl IdempotencyScope {
    /// Build a scope.
    pub fn new(
        merchant_id: impl Into<String>,
        operation: impl Into<String>,
        caller_key: impl Into<String>,
    ) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            operation: operation.into(),
            caller_key: caller_key.into(),
        }
    }

    /// The composite storage key.
    pub fn scoped_key(&self) -> String {
        format!("{}:{}:{}", self.merchant_id, self.operation, self.caller_key)
    }
}

/// Tuning for the idempotency engine.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyConfig {
    /// How long cached outcomes are served.
    pub ttl: Duration,
    /// How long to wait for the per-key admission lock.
    pub lock_timeout: Duration,
    /// Pause between polls while another caller's work is in flight.
    pub poll_interval: Duration,
    /// How many polls before giving up with `LockTimeout`.
    pub max_polls: u32,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            lock_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            max_polls: 50,
        }
    }
}

/// The idempotency engine: fingerprint validation, per-key locking, and
/// outcome caching over pluggable store and lock ports.
pub struct IdempotencyEngine {
    store: Arc<dyn IdempotencyStore>,
    locks: Arc<dyn LockManager>,
    config: IdempotencyConfig,
}

impl IdempotencyEngine {
    /// Build an engine over the given ports.
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        locks: Arc<dyn LockManager>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Run `do_work` exactly once for this scope and request body.
    ///
    /// - First admission inserts a `Processing` record, runs the work, and
    ///   caches the outcome (success or failure).
    /// - A duplicate with the same fingerprint is served the cached outcome,
    ///   polling while the first run is still in flight.
    /// - A duplicate with a different fingerprint fails with
    ///   `FingerprintMismatch` and never executes.
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &IdempotencyScope,
        request: &Value,
        do_work: F,
    ) -> Result<T, PaymentError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PaymentError>>,
    {
        let scoped_key = scope.scoped_key();
        let request_fingerprint = fingerprint(request);

        let lease = self
            .locks
            .acquire(&scoped_key, self.config.lock_timeout, self.config.lock_timeout)
            .await?;

        let existing = match self.store.get(&scoped_key).await {
            Ok(existing) => existing,
            Err(error) => {
                let _ = self.locks.release(&lease).await;
                return Err(error.into());
            }
        };

        match existing {
            None => {
                let ttl = chrono::Duration::from_std(self.config.ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
                let record =
                    IdempotencyRecord::processing(&scoped_key, &request_fingerprint, ttl);
                let inserted = self.store.put(record.clone()).await;
                let _ = self.locks.release(&lease).await;
                inserted?;

                let outcome = do_work().await;
                self.settle(record, &outcome).await;
                outcome
            }
            Some(record) => {
                let _ = self.locks.release(&lease).await;

                if record.fingerprint != request_fingerprint {
                    return Err(PaymentError::FingerprintMismatch { scoped_key });
                }

                match record.status {
                    IdempotencyStatus::Completed | IdempotencyStatus::Failed => {
                        Self::serve_cached(record)
                    }
                    IdempotencyStatus::Processing => {
                        self.poll_for_terminal(&scoped_key).await
                    }
                }
            }
        }
    }

    /// Sweep expired records. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize, PaymentError> {
        Ok(self.store.expire_before(Utc::now()).await?)
    }

    async fn settle<T: Serialize>(
        &self,
        record: IdempotencyRecord,
        outcome: &Result<T, PaymentError>,
    ) {
        let settled = match outcome {
            Ok(value) => match serde_json::to_value(value) {
                Ok(cached) => record.completed(cached),
                Err(error) => {
                    tracing::warn!(
                        scoped_key = %record.scoped_key,
                        error = %error,
                        "failed to serialize idempotent result; caching as failure"
                    );
                    record.failed(
                        PaymentError::Internal(format!("uncacheable result: {error}"))
                            .to_record(),
                    )
                }
            },
            Err(error) => record.failed(error.to_record()),
        };

        if let Err(error) = self
            .store
            .cas(settled, IdempotencyStatus::Processing)
            .await
        {
            tracing::warn!(error = %error, "failed to settle idempotency record");
        }
    }

    fn serve_cached<T: DeserializeOwned>(record: IdempotencyRecord) -> Result<T, PaymentError> {
        match record.status {
            IdempotencyStatus::Completed => {
                let cached = record.result.ok_or_else(|| {
                    PaymentError::Internal("completed record without result".to_string())
                })?;
                Ok(serde_json::from_value(cached)?)
            }
            IdempotencyStatus::Failed => {
                let cached = record.error.ok_or_else(|| {
                    PaymentError::Internal("failed record without error".to_string())
                })?;
                Err(PaymentError::from_record(cached))
            }
            IdempotencyStatus::Processing => Err(PaymentError::Internal(
                "cannot serve an in-flight record".to_string(),
            )),
        }
    }

    async fn poll_for_terminal<T: DeserializeOwned>(
        &self,
        scoped_key: &str,
    ) -> Result<T, PaymentError> {
        for _ in 0..self.config.max_polls {
            tokio::time::sleep(self.config.poll_interval).await;

            match self.store.get(scoped_key).await? {
                Some(record) if record.is_terminal() => return Self::serve_cached(record),
                Some(_) => continue,
                // The in-flight record expired; the original runner is gone.
                None => break,
            }
        }
        Err(PaymentError::LockTimeout {
            name: scoped_key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::lock::InMemoryLockManager;

    fn engine() -> IdempotencyEngine {
        engine_with_config(IdempotencyConfig {
            poll_interval: Duration::from_millis(10),
            max_polls: 50,
            ..Default::default()
        })
    }

    fn engine_with_config(config: IdempotencyConfig) -> IdempotencyEngine {
        IdempotencyEngine::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InMemoryLockManager::new()),
            config,
        )
    }

    fn scope() -> IdempotencyScope {
        IdempotencyScope::new("m1", "create_payment", "k1")
    }

    #[test]
    fn test_scoped_key_format() {
        assert_eq!(scope().scoped_key(), "m1:create_payment:k1");
    }

    #[tokio::test]
    async fn test_first_admission_runs_work() {
        let engine = engine();
        let result = engine
            .execute(&scope(), &json!({"amount": 100}), || async {
                Ok::<_, PaymentError>("done".to_string())
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn test_duplicate_serves_cached_result_without_rerunning() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let body = json!({"amount": 100});

        for _ in 0..3 {
            let calls = calls.clone();
            let result: String = engine
                .execute(&scope(), &body, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("payment-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(result, "payment-1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_a_hard_error() {
        let engine = engine();
        let _: String = engine
            .execute(&scope(), &json!({"amount": 100}), || async {
                Ok("p1".to_string())
            })
            .await
            .unwrap();

        let tampered = engine
            .execute(&scope(), &json!({"amount": 500}), || async {
                Ok("p2".to_string())
            })
            .await;

        assert!(matches!(
            tampered,
            Err(PaymentError::FingerprintMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_outcomes_are_cached() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let body = json!({"amount": 100});

        for _ in 0..2 {
            let calls = calls.clone();
            let result: Result<String, _> = engine
                .execute(&scope(), &body, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PaymentError::Validation("bad amount".to_string()))
                })
                .await;
            assert!(matches!(result, Err(PaymentError::Validation(_))));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_run_work_once() {
        let engine = Arc::new(engine());
        let calls = Arc::new(AtomicU32::new(0));
        let body = json!({"amount": 100});

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let calls = calls.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .execute(&scope(), &body, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the in-flight window open a moment.
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, PaymentError>("p1".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "p1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_gives_up_with_lock_timeout() {
        let engine = engine_with_config(IdempotencyConfig {
            poll_interval: Duration::from_millis(5),
            max_polls: 3,
            ..Default::default()
        });

        // Wedge a Processing record with no worker behind it.
        let store = InMemoryIdempotencyStore::new();
        let scoped = scope().scoped_key();
        let body = json!({"amount": 100});
        let record = IdempotencyRecord::processing(
            &scoped,
            fingerprint(&body),
            chrono::Duration::hours(1),
        );

        let engine = IdempotencyEngine::new(
            Arc::new(store),
            Arc::new(InMemoryLockManager::new()),
            engine.config.clone(),
        );
        engine.store.put(record).await.unwrap();

        let result: Result<String, _> = engine
            .execute(&scope(), &body, || async { Ok("never".to_string()) })
            .await;
        assert!(matches!(result, Err(PaymentError::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired_records() {
        let engine = engine_with_config(IdempotencyConfig {
            ttl: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            max_polls: 2,
            ..Default::default()
        });

        let _: String = engine
            .execute(&scope(), &json!({"a": 1}), || async { Ok("p".to_string()) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = engine.cleanup().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_expired_record_admits_fresh_run() {
        let engine = engine_with_config(IdempotencyConfig {
            ttl: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            max_polls: 2,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let body = json!({"a": 1});

        for _ in 0..2 {
            let calls = calls.clone();
            let _: String = engine
                .execute(&scope(), &body, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("p".to_string())
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // TTL elapsed between calls, so the second admission reruns.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
