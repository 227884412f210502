//! Postgres-backed event store.
//!
//! Site isolation is part of every WHERE clause; optimistic concurrency is
//! enforced in a transaction plus a unique constraint on
//! `(site_id, aggregate_id, sequence_number)` that catches the race between
//! the version check and the insert.
//!
//! The `EventStore` trait is synchronous; the async sqlx calls are bridged
//! with `tokio::runtime::Handle::block_on`, so the store must be called
//! from within a tokio runtime.

use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use stockroom_core::{AggregateId, ExpectedVersion, SiteId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), fields(site_id = %site_id, aggregate_id = %aggregate_id), err)]
    pub async fn load_stream_async(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, site_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, event_version, occurred_at, payload
            FROM events
            WHERE site_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(site_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(row_to_stored).collect()
    }

    #[instrument(skip(self), fields(site_id = %site_id), err)]
    pub async fn load_site_async(
        &self,
        site_id: SiteId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, site_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, event_version, occurred_at, payload
            FROM events
            WHERE site_id = $1
            ORDER BY aggregate_id ASC, sequence_number ASC
            "#,
        )
        .bind(site_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_site", e))?;

        rows.iter().map(row_to_stored).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn load_all_async(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, site_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, event_version, occurred_at, payload
            FROM events
            ORDER BY aggregate_id ASC, sequence_number ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        rows.iter().map(row_to_stored).collect()
    }

    /// Append several stream batches inside one transaction.
    #[instrument(skip(self, batches), fields(batch_count = batches.len()), err)]
    pub async fn append_batches_async(
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

        for batch in &batches {
            validate_batch(&batch.events)?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut committed = Vec::new();
        for batch in batches {
            match append_one_stream(&mut tx, batch).await {
                Ok(stored) => committed.extend(stored),
                Err(err) => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(err);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(committed)
    }
}

fn validate_batch(events: &[UncommittedEvent]) -> Result<(), EventStoreError> {
    let site_id = events[0].site_id;
    let aggregate_id = events[0].aggregate_id;
    let aggregate_type = &events[0].aggregate_type;

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
        if e.aggregate_type != *aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }
    Ok(())
}

async fn append_one_stream(
    tx: &mut Transaction<'_, Postgres>,
    batch: StreamBatch,
) -> Result<Vec<StoredEvent>, EventStoreError> {
    let site_id = batch.events[0].site_id;
    let aggregate_id = batch.events[0].aggregate_id;
    let aggregate_type = batch.events[0].aggregate_type.clone();

    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_number), 0) AS current_version,
               MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE site_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(site_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::InvalidAppend(format!("bad version row: {e}")))?;
    let current_version = current_version as u64;
    let existing_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::InvalidAppend(format!("bad version row: {e}")))?;

    if let Some(existing) = existing_type
        && existing != aggregate_type
    {
        return Err(EventStoreError::AggregateTypeMismatch(format!(
            "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
        )));
    }

    if !batch.expected_version.matches(current_version) {
        return Err(EventStoreError::Concurrency(format!(
            "expected {:?}, found {current_version}",
            batch.expected_version
        )));
    }

    let mut stored_events = Vec::with_capacity(batch.events.len());
    let mut next_sequence = current_version + 1;

    for event in batch.events {
        sqlx::query(
            r#"
            INSERT INTO events (
                event_id, site_id, aggregate_id, aggregate_type,
                sequence_number, event_type, event_version, occurred_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.event_id)
        .bind(site_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .bind(&aggregate_type)
        .bind(next_sequence as i64)
        .bind(&event.event_type)
        .bind(event.event_version as i32)
        .bind(event.occurred_at)
        .bind(&event.payload)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::Concurrency(format!(
                    "concurrent append detected: sequence_number {next_sequence} already exists"
                ))
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        stored_events.push(StoredEvent {
            event_id: event.event_id,
            site_id: event.site_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            sequence_number: next_sequence,
            event_type: event.event_type,
            event_version: event.event_version,
            occurred_at: event.occurred_at,
            payload: event.payload,
        });
        next_sequence += 1;
    }

    Ok(stored_events)
}

fn row_to_stored(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let bad = |e: sqlx::Error| EventStoreError::InvalidAppend(format!("bad event row: {e}"));
    let sequence_number: i64 = row.try_get("sequence_number").map_err(bad)?;
    let event_version: i32 = row.try_get("event_version").map_err(bad)?;

    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(bad)?,
        site_id: SiteId::from_uuid(row.try_get("site_id").map_err(bad)?),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(bad)?),
        aggregate_type: row.try_get("aggregate_type").map_err(bad)?,
        sequence_number: sequence_number as u64,
        event_type: row.try_get("event_type").map_err(bad)?,
        event_version: event_version as u32,
        occurred_at: row.try_get("occurred_at").map_err(bad)?,
        payload: row.try_get("payload").map_err(bad)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    EventStoreError::InvalidAppend(format!("{operation} failed: {err}"))
}

fn runtime_handle() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::InvalidAppend(
            "PostgresEventStore requires a tokio runtime context".to_string(),
        )
    })
}

impl EventStore for PostgresEventStore {
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
        runtime_handle()?.block_on(self.append_batches_async(batches))
    }

    fn load_stream(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_stream_async(site_id, aggregate_id))
    }

    fn load_site(&self, site_id: SiteId) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_site_async(site_id))
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_all_async())
    }
}
