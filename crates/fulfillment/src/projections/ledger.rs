use serde_json::Value as JsonValue;

use stockroom_core::SiteId;
use stockroom_events::EventEnvelope;
use stockroom_inventory::{ProductEvent, ProductId, StockMovement};

use crate::read_model::SiteStore;

use super::{ProjectionError, StreamCursors};

/// Ledger projection: per-product movement history.
///
/// The product streams already are the ledger; this projection is just the
/// query surface over them (movement history for audit screens and
/// reconciliation). Entries are append-only in stream order.
#[derive(Debug)]
pub struct LedgerProjection<S>
where
    S: SiteStore<ProductId, Vec<StockMovement>>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> LedgerProjection<S>
where
    S: SiteStore<ProductId, Vec<StockMovement>>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    /// Movement history for one product, oldest first.
    pub fn history(&self, site_id: SiteId, product_id: &ProductId) -> Vec<StockMovement> {
        self.store.get(site_id, product_id).unwrap_or_default()
    }

    /// On-hand balance as the sum of recorded deltas.
    pub fn balance(&self, site_id: SiteId, product_id: &ProductId) -> i64 {
        self.history(site_id, product_id)
            .iter()
            .map(|m| m.delta)
            .sum()
    }

    /// Movements that bypassed the non-negative balance guard.
    pub fn forced_movements(&self, site_id: SiteId) -> Vec<StockMovement> {
        self.store
            .list(site_id)
            .into_iter()
            .flatten()
            .filter(|m| m.forced)
            .collect()
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != "inventory.product" {
            return Ok(());
        }

        let site_id = envelope.site_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if !self.cursors.check(site_id, aggregate_id, seq)? {
            return Ok(());
        }

        let event: ProductEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        if let ProductEvent::StockAdjusted(e) = event {
            if e.site_id != site_id {
                return Err(ProjectionError::SiteIsolation(
                    "event site_id does not match envelope site_id".to_string(),
                ));
            }
            if e.product_id.0 != aggregate_id {
                return Err(ProjectionError::SiteIsolation(
                    "event product_id does not match envelope aggregate_id".to_string(),
                ));
            }

            let mut history = self.store.get(site_id, &e.product_id).unwrap_or_default();
            history.push(StockMovement {
                product_id: e.product_id,
                delta: e.delta,
                reason: e.reason,
                reference: e.reference,
                forced: e.forced,
                occurred_at: e.occurred_at,
            });
            self.store.upsert(site_id, e.product_id, history);
        }

        self.cursors.advance(site_id, aggregate_id, seq);
        Ok(())
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
