use std::collections::HashMap;
use std::sync::RwLock;

use stockroom_core::{AggregateId, ExpectedVersion, SiteId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    site_id: SiteId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn validate_batch(events: &[UncommittedEvent]) -> Result<StreamKey, EventStoreError> {
        let site_id = events[0].site_id;
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.site_id != site_id {
                return Err(EventStoreError::SiteIsolation(format!(
                    "batch contains multiple site_ids (index {idx})"
                )));
            }
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        Ok(StreamKey {
            site_id,
            aggregate_id,
        })
    }

    /// Check a batch against the live map without mutating anything.
    fn check_batch(
        streams: &HashMap<StreamKey, Vec<StoredEvent>>,
        key: StreamKey,
        batch: &StreamBatch,
    ) -> Result<u64, EventStoreError> {
        let stream = streams.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let current = Self::current_version(stream);

        if !batch.expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {:?}, found {current}",
                batch.expected_version
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            let attempted = &batch.events[0].aggregate_type;
            if existing.aggregate_type != *attempted {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{attempted}'",
                    existing.aggregate_type
                )));
            }
        }

        Ok(current)
    }

    fn commit_batch(
        streams: &mut HashMap<StreamKey, Vec<StoredEvent>>,
        key: StreamKey,
        current: u64,
        events: Vec<UncommittedEvent>,
    ) -> Vec<StoredEvent> {
        let stream = streams.entry(key).or_default();
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                site_id: e.site_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }
        committed
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        self.append_batches(vec![StreamBatch::new(expected_version, events)])
    }

    fn append_batches(
        &self,
        batches: Vec<StreamBatch>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batches: Vec<StreamBatch> = batches
            .into_iter()
            .filter(|b| !b.events.is_empty())
            .collect();
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let mut keys = Vec::with_capacity(batches.len());
        for batch in &batches {
            let key = Self::validate_batch(&batch.events)?;
            if keys.contains(&key) {
                return Err(EventStoreError::InvalidAppend(
                    "duplicate stream in multi-stream append".to_string(),
                ));
            }
            keys.push(key);
        }

        // Single write lock for the whole set gives all-or-nothing commit:
        // every version check passes before any event is pushed.
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut currents = Vec::with_capacity(batches.len());
        for (key, batch) in keys.iter().zip(&batches) {
            currents.push(Self::check_batch(&streams, *key, batch)?);
        }

        let mut committed = Vec::new();
        for ((key, batch), current) in keys.into_iter().zip(batches).zip(currents) {
            committed.extend(Self::commit_batch(&mut streams, key, current, batch.events));
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            site_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&key).cloned().unwrap_or_default())
    }

    fn load_site(&self, site_id: SiteId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut events: Vec<StoredEvent> = streams
            .iter()
            .filter(|(key, _)| key.site_id == site_id)
            .flat_map(|(_, stream)| stream.iter().cloned())
            .collect();
        events.sort_by(|a, b| {
            (a.aggregate_id.as_uuid(), a.sequence_number)
                .cmp(&(b.aggregate_id.as_uuid(), b.sequence_number))
        });

        Ok(events)
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut events: Vec<StoredEvent> = streams
            .values()
            .flat_map(|stream| stream.iter().cloned())
            .collect();
        events.sort_by(|a, b| {
            (a.aggregate_id.as_uuid(), a.sequence_number)
                .cmp(&(b.aggregate_id.as_uuid(), b.sequence_number))
        });

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn uncommitted(site_id: SiteId, aggregate_id: AggregateId) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            site_id,
            aggregate_id,
            aggregate_type: "test.thing".to_string(),
            event_type: "test.thing.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({"ok": true}),
        }
    }

    #[test]
    fn append_assigns_sequence_numbers_from_one() {
        let store = InMemoryEventStore::new();
        let site = SiteId::new();
        let agg = AggregateId::new();

        let committed = store
            .append(
                vec![uncommitted(site, agg), uncommitted(site, agg)],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(committed[1].sequence_number, 2);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let site = SiteId::new();
        let agg = AggregateId::new();

        store
            .append(vec![uncommitted(site, agg)], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![uncommitted(site, agg)], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn multi_stream_append_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let site = SiteId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        // Seed stream b so an Exact(0) expectation on it fails.
        store
            .append(vec![uncommitted(site, b)], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append_batches(vec![
                StreamBatch::new(ExpectedVersion::Exact(0), vec![uncommitted(site, a)]),
                StreamBatch::new(ExpectedVersion::Exact(0), vec![uncommitted(site, b)]),
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        // Stream a must not have been touched.
        assert!(store.load_stream(site, a).unwrap().is_empty());
    }

    #[test]
    fn streams_are_isolated_per_site() {
        let store = InMemoryEventStore::new();
        let site_a = SiteId::new();
        let site_b = SiteId::new();
        let agg = AggregateId::new();

        store
            .append(vec![uncommitted(site_a, agg)], ExpectedVersion::Exact(0))
            .unwrap();

        assert!(store.load_stream(site_b, agg).unwrap().is_empty());
        assert_eq!(store.load_site(site_a).unwrap().len(), 1);
        assert!(store.load_site(site_b).unwrap().is_empty());
    }
}
