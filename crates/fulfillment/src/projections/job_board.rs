use serde_json::Value as JsonValue;

use stockroom_core::{Actor, SiteId};
use stockroom_events::EventEnvelope;
use stockroom_warehouse::{JobId, JobPriority, JobStatus, JobType, OrderRef, WmsJobEvent};

use crate::read_model::SiteStore;

use super::{ProjectionError, StreamCursors};

/// One row on the floor's job board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCard {
    pub job_id: JobId,
    pub job_number: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub order_ref: Option<OrderRef>,
    pub assigned_to: Option<Actor>,
    pub open_line_count: usize,
    pub line_count: usize,
}

impl JobCard {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Job board projection: the dispatcher's view of floor work.
///
/// Besides the list screens, this answers the one query the orchestrator
/// depends on for idempotent receiving: is there already an active job of a
/// given type for this order?
#[derive(Debug)]
pub struct JobBoardProjection<S>
where
    S: SiteStore<JobId, JobCard>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> JobBoardProjection<S>
where
    S: SiteStore<JobId, JobCard>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, site_id: SiteId, job_id: &JobId) -> Option<JobCard> {
        self.store.get(site_id, job_id)
    }

    pub fn list(&self, site_id: SiteId) -> Vec<JobCard> {
        let mut cards = self.store.list(site_id);
        cards.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.job_number.cmp(&b.job_number))
        });
        cards
    }

    pub fn list_by_status(&self, site_id: SiteId, status: JobStatus) -> Vec<JobCard> {
        self.list(site_id)
            .into_iter()
            .filter(|c| c.status == status)
            .collect()
    }

    pub fn list_by_order_ref(&self, site_id: SiteId, order_ref: OrderRef) -> Vec<JobCard> {
        self.list(site_id)
            .into_iter()
            .filter(|c| c.order_ref == Some(order_ref))
            .collect()
    }

    /// The active (non-terminal) job of one type for an order, if any.
    ///
    /// At most one such job exists per (order, type); the orchestrator
    /// checks here before spawning to keep receives idempotent.
    pub fn active_job_for(
        &self,
        site_id: SiteId,
        order_ref: OrderRef,
        job_type: JobType,
    ) -> Option<JobCard> {
        self.list_by_order_ref(site_id, order_ref)
            .into_iter()
            .find(|c| c.job_type == job_type && c.is_active())
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != "warehouse.job" {
            return Ok(());
        }

        let site_id = envelope.site_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if !self.cursors.check(site_id, aggregate_id, seq)? {
            return Ok(());
        }

        let event: WmsJobEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        match event {
            WmsJobEvent::Created {
                site_id: event_site,
                job_id,
                job_number,
                job_type,
                priority,
                order_ref,
                lines,
                ..
            } => {
                if event_site != site_id {
                    return Err(ProjectionError::SiteIsolation(
                        "event site_id does not match envelope site_id".to_string(),
                    ));
                }
                self.store.upsert(
                    site_id,
                    job_id,
                    JobCard {
                        job_id,
                        job_number,
                        job_type,
                        status: JobStatus::Pending,
                        priority,
                        order_ref,
                        assigned_to: None,
                        open_line_count: lines.len(),
                        line_count: lines.len(),
                    },
                );
            }
            WmsJobEvent::Assigned {
                job_id, assignee, ..
            } => {
                if let Some(mut card) = self.store.get(site_id, &job_id) {
                    card.assigned_to = Some(assignee);
                    if card.status == JobStatus::Pending {
                        card.status = JobStatus::Assigned;
                    }
                    self.store.upsert(site_id, job_id, card);
                }
            }
            WmsJobEvent::Started { job_id, .. } => {
                self.update_status(site_id, job_id, JobStatus::InProgress);
            }
            WmsJobEvent::LineFulfilled { .. } => {
                // Per-line progress stays inside the aggregate; the board
                // only tracks open-line counts on completion/reset.
            }
            WmsJobEvent::Completed { job_id, .. } => {
                if let Some(mut card) = self.store.get(site_id, &job_id) {
                    card.status = JobStatus::Completed;
                    card.open_line_count = 0;
                    self.store.upsert(site_id, job_id, card);
                }
            }
            WmsJobEvent::Cancelled { job_id, .. } => {
                self.update_status(site_id, job_id, JobStatus::Cancelled);
            }
            WmsJobEvent::Reset { job_id, .. } => {
                if let Some(mut card) = self.store.get(site_id, &job_id) {
                    card.status = JobStatus::Pending;
                    card.assigned_to = None;
                    card.open_line_count = card.line_count;
                    self.store.upsert(site_id, job_id, card);
                }
            }
            WmsJobEvent::LineRelinked { .. } => {}
        }

        self.cursors.advance(site_id, aggregate_id, seq);
        Ok(())
    }

    fn update_status(&self, site_id: SiteId, job_id: JobId, status: JobStatus) {
        if let Some(mut card) = self.store.get(site_id, &job_id) {
            card.status = status;
            self.store.upsert(site_id, job_id, card);
        }
    }

    pub fn rebuild_from_scratch(
        &self,
        site_id: SiteId,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        self.cursors.reset();
        self.store.clear_site(site_id);
        for env in envelopes {
            self.apply_envelope(&env)?;
        }
        Ok(())
    }
}
