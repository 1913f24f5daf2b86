//! Append-only event log, partitioned by aggregate id.
//!
//! Appends are atomic per call and gap-free: an event whose version is not
//! exactly `last_stored + 1` for its aggregate rejects the whole batch.

mod sourcing;

pub use sourcing::{replay, SourcingCoordinator};

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::error::PaymentError;
use crate::domain::events::{PaymentEvent, PaymentEventType};
use crate::domain::payment::PaymentId;

/// Errors from the event store.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EventStoreError {
    /// An appended event did not continue its aggregate's stream.
    #[error("version mismatch on {aggregate_id}: expected {expected}, got {got}")]
    VersionMismatch {
        /// Aggregate id.
        aggregate_id: String,
        /// Expected next version.
        expected: u64,
        /// Version offered.
        got: u64,
    },

    /// Backend failure.
    #[error("event store failure: {0}")]
    Storage(String),
}

impl From<EventStoreError> for PaymentError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::VersionMismatch {
                aggregate_id,
                expected,
                got,
            } => PaymentError::EventVersionMismatch {
                aggregate_id,
                expected,
                got,
            },
            EventStoreError::Storage(message) => PaymentError::Internal(message),
        }
    }
}

/// Port for append-only event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch atomically. Every event's version must be exactly
    /// `last_stored + 1` for its aggregate (counting earlier events in the
    /// same batch), or the whole batch is rejected.
    async fn append(&self, events: Vec<PaymentEvent>) -> Result<(), EventStoreError>;

    /// All events for an aggregate, in version order.
    async fn events(&self, aggregate_id: &PaymentId)
        -> Result<Vec<PaymentEvent>, EventStoreError>;

    /// Events for an aggregate with version strictly greater than `version`.
    async fn events_after_version(
        &self,
        aggregate_id: &PaymentId,
        version: u64,
    ) -> Result<Vec<PaymentEvent>, EventStoreError>;

    /// Latest stored version for an aggregate (0 when the stream is empty).
    async fn current_version(&self, aggregate_id: &PaymentId) -> Result<u64, EventStoreError>;

    /// Every event of a given type, ordered by aggregate id then version.
    async fn events_by_type(
        &self,
        event_type: PaymentEventType,
    ) -> Result<Vec<PaymentEvent>, EventStoreError>;

    /// Every aggregate with at least one event, sorted for determinism.
    async fn aggregate_ids(&self) -> Result<Vec<PaymentId>, EventStoreError>;
}

/// In-memory event store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<PaymentId, Vec<PaymentEvent>>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<PaymentEvent>) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut streams = self.streams.write().await;

        // Validate the whole batch before touching any stream.
        let mut next_versions: HashMap<PaymentId, u64> = HashMap::new();
        for event in &events {
            let expected = *next_versions.entry(event.aggregate_id).or_insert_with(|| {
                streams
                    .get(&event.aggregate_id)
                    .map(|s| s.len() as u64 + 1)
                    .unwrap_or(1)
            });
            if event.version != expected {
                return Err(EventStoreError::VersionMismatch {
                    aggregate_id: event.aggregate_id.to_string(),
                    expected,
                    got: event.version,
                });
            }
            next_versions.insert(event.aggregate_id, expected + 1);
        }

        for event in events {
            streams.entry(event.aggregate_id).or_default().push(event);
        }
        Ok(())
    }

    async fn events(
        &self,
        aggregate_id: &PaymentId,
    ) -> Result<Vec<PaymentEvent>, EventStoreError> {
        let streams = self.streams.read().await;
        Ok(streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn events_after_version(
        &self,
        aggregate_id: &PaymentId,
        version: u64,
    ) -> Result<Vec<PaymentEvent>, EventStoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version > version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn current_version(&self, aggregate_id: &PaymentId) -> Result<u64, EventStoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(aggregate_id)
            .and_then(|s| s.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }

    async fn events_by_type(
        &self,
        event_type: PaymentEventType,
    ) -> Result<Vec<PaymentEvent>, EventStoreError> {
        let streams = self.streams.read().await;
        let mut ids: Vec<&PaymentId> = streams.keys().collect();
        ids.sort();

        let mut matching = Vec::new();
        for id in ids {
            for event in &streams[id] {
                if event.event_type() == event_type {
                    matching.push(event.clone());
                }
            }
        }
        Ok(matching)
    }

    async fn aggregate_ids(&self) -> Result<Vec<PaymentId>, EventStoreError> {
        let streams = self.streams.read().await;
        let mut ids: Vec<PaymentId> = streams.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
