//! Read-model projections over published event envelopes.
//!
//! All three projections here are disposable: drop them and replay the
//! site's streams to get them back. They consume the JSON envelopes the
//! bus distributes, enforce site isolation, and tolerate at-least-once
//! delivery via per-stream cursors.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use stockroom_core::{AggregateId, SiteId};

pub mod catalog;
pub mod job_board;
pub mod ledger;

pub use catalog::{CatalogEntry, CatalogProjection};
pub use job_board::{JobBoardProjection, JobCard};
pub use ledger::LedgerProjection;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("site isolation violation: {0}")]
    SiteIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    site_id: SiteId,
    aggregate_id: AggregateId,
}

/// Per-stream cursors supporting idempotent at-least-once consumption.
///
/// `advance` reports whether the envelope should be applied: replays at or
/// below the cursor are skipped silently, gaps are an error.
#[derive(Debug, Default)]
pub(crate) struct StreamCursors {
    inner: RwLock<HashMap<CursorKey, u64>>,
}

impl StreamCursors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn check(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        seq: u64,
    ) -> Result<bool, ProjectionError> {
        let key = CursorKey {
            site_id,
            aggregate_id,
        };
        let cursors = self
            .inner
            .read()
            .map_err(|_| ProjectionError::Deserialize("cursor lock poisoned".to_string()))?;
        let last = *cursors.get(&key).unwrap_or(&0);

        if seq == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(false);
        }
        if last != 0 && seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        Ok(true)
    }

    pub(crate) fn advance(&self, site_id: SiteId, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut cursors) = self.inner.write() {
            cursors.insert(
                CursorKey {
                    site_id,
                    aggregate_id,
                },
                seq,
            );
        }
    }

    pub(crate) fn reset(&self) {
        if let Ok(mut cursors) = self.inner.write() {
            cursors.clear();
        }
    }
}
