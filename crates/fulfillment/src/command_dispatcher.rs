//! Command execution pipeline.
//!
//! Dispatching a command runs the full event-sourcing lifecycle: load the
//! stream, rehydrate the aggregate, let it decide, append the decided
//! events with an optimistic concurrency check, then publish them.
//!
//! Cross-aggregate flows (complete a job + post its ledger entries) use
//! the staged variant: each aggregate's decided events become a
//! [`StreamBatch`] with the version observed at load, and `commit` hands
//! the whole set to `EventStore::append_batches` so they land atomically.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockroom_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, SiteId};
use stockroom_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Site isolation violation (cross-site stream mixing).
    #[error("site isolation violation: {0}")]
    SiteIsolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("invalid site type: {0}")]
    InvalidSiteType(String),

    #[error("not found")]
    NotFound,

    /// Failed to deserialize historical payloads into the aggregate event type.
    #[error("event deserialization failed: {0}")]
    Deserialize(String),

    #[error("event store error: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append (at-least-once; the
    /// events are durable, retrying publication may duplicate).
    #[error("publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            EventStoreError::SiteIsolation(msg) => DispatchError::SiteIsolation(msg.clone()),
            EventStoreError::Publish(msg) => DispatchError::Publish(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::StateConflict(msg) => DispatchError::StateConflict(msg),
            DomainError::InsufficientStock {
                requested,
                available,
            } => DispatchError::InsufficientStock {
                requested,
                available,
            },
            DomainError::UnresolvedReference(msg) => DispatchError::UnresolvedReference(msg),
            DomainError::InvalidSiteType(msg) => DispatchError::InvalidSiteType(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Composes an [`EventStore`] and an [`EventBus`]; swap in the in-memory
/// implementations for tests and the Postgres store in production without
/// touching domain code.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Rehydrate an aggregate from its stream.
    ///
    /// Returns the aggregate together with the stream version observed at
    /// load; that version is the optimistic-concurrency expectation for any
    /// append staged against this state.
    pub fn load_aggregate<A>(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<(A, u64), DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(site_id, aggregate_id)?;
        validate_loaded_stream(site_id, aggregate_id, &history)?;
        let version = stream_version(&history);

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok((aggregate, version))
    }

    /// Let a loaded aggregate decide a command and stage the result.
    ///
    /// Returns `None` when the aggregate reports an idempotent no-op (empty
    /// event vector). The caller supplies `loaded_version` from
    /// [`Self::load_aggregate`] so staged batches carry the right
    /// expectation.
    pub fn stage<A>(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        aggregate: &A,
        loaded_version: u64,
        command: &A::Command,
    ) -> Result<Option<StreamBatch>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: stockroom_events::Event + Serialize,
    {
        let decided = aggregate.handle(command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(None);
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    site_id,
                    aggregate_id,
                    aggregate_type,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StreamBatch::new(
            ExpectedVersion::Exact(loaded_version),
            uncommitted,
        )))
    }

    /// Commit staged batches atomically, then publish.
    pub fn commit(&self, batches: Vec<StreamBatch>) -> Result<Vec<StoredEvent>, DispatchError> {
        if batches.is_empty() {
            return Ok(vec![]);
        }
        let committed = self.store.append_batches(batches)?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }

    /// Dispatch a single command through the full pipeline.
    pub fn dispatch<A>(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: stockroom_events::Command,
        A::Event: stockroom_events::Event + Serialize + DeserializeOwned,
    {
        // A command addressed to a different aggregate must never land on
        // this stream.
        if stockroom_events::Command::target_aggregate_id(command) != aggregate_id {
            return Err(DispatchError::Validation(format!(
                "command targets aggregate {} but was dispatched to {aggregate_id}",
                stockroom_events::Command::target_aggregate_id(command),
            )));
        }

        let (aggregate, version) =
            self.load_aggregate(site_id, aggregate_id, make_aggregate)?;

        match self.stage(site_id, aggregate_id, aggregate_type, &aggregate, version, command)? {
            None => Ok(vec![]),
            Some(batch) => self.commit(vec![batch]),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    site_id: SiteId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Enforce site isolation even if a buggy backend returns cross-site
    // data, and require monotonic sequence numbers.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.site_id != site_id {
            return Err(DispatchError::SiteIsolation(format!(
                "loaded stream contains wrong site_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::SiteIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number == 0 {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                "stored event has sequence_number=0".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(
                format!(
                    "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                    e.sequence_number
                ),
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
