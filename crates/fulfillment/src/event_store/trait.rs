use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use std::sync::Arc;
use stockroom_core::{AggregateId, ExpectedVersion, SiteId};

/// An event ready to be appended to a stream (not yet assigned a sequence
/// number). The store assigns sequence numbers during append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub site_id: SiteId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream.
///
/// Sequence numbers are stream-scoped (per `(site_id, aggregate_id)`),
/// monotonically increasing, and immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub site_id: SiteId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into a site-scoped envelope for publication.
    pub fn to_envelope(&self) -> stockroom_events::EventEnvelope<JsonValue> {
        stockroom_events::EventEnvelope::new(
            self.event_id,
            self.site_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// One stream's contribution to a multi-stream append.
///
/// Each batch carries its own optimistic-concurrency expectation; the whole
/// set commits or none of it does. This is how a job completion and its
/// ledger entries land together.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

impl StreamBatch {
    pub fn new(expected_version: ExpectedVersion, events: Vec<UncommittedEvent>) -> Self {
        Self {
            expected_version,
            events,
        }
    }
}

/// Event store operation error (infrastructure, not domain).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("site isolation violation: {0}")]
    SiteIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only, site-scoped event store.
///
/// Events are organized into streams, one per aggregate instance, keyed by
/// `(site_id, aggregate_id)`. Within a stream sequence numbers increase
/// monotonically from 1 with no gaps.
///
/// Implementations must:
/// - enforce site isolation on reads and writes
/// - enforce optimistic concurrency against the current stream version
/// - assign sequence numbers monotonically
/// - persist each append atomically (all events in a batch or none)
pub trait EventStore: Send + Sync {
    /// Append events to a single aggregate stream.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Append to several streams atomically.
    ///
    /// All batches commit or none do; a concurrency failure on any stream
    /// aborts the whole set. Batches may span sites (transfers touch the
    /// source and destination site in one commit).
    fn append_batches(
        &self,
        batches: Vec<StreamBatch>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for a site + aggregate.
    ///
    /// Returns an empty vector if the stream does not exist.
    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every event for a site, ordered by `(aggregate_id, sequence_number)`.
    ///
    /// This is the scan path for read-model rebuilds and reconciliation; it
    /// is not a hot path.
    fn load_site(&self, site_id: SiteId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every event in the store across all sites, ordered by
    /// `(aggregate_id, sequence_number)`.
    ///
    /// Startup-only scan used to seed sequence allocators so restarted
    /// services continue document numbering where the last process left off.
    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn append_batches(
        &self,
        batches: Vec<StreamBatch>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_batches(batches)
    }

    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(site_id, aggregate_id)
    }

    fn load_site(&self, site_id: SiteId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_site(site_id)
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_all()
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Serializes the payload and captures the event metadata needed to
    /// deserialize it later, keeping this crate decoupled from the domain
    /// event types themselves.
    pub fn from_typed<E>(
        site_id: SiteId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: stockroom_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            site_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
