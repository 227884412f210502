use serde_json::Value as JsonValue;

use stockroom_core::{SiteId, Sku};
use stockroom_events::EventEnvelope;
use stockroom_inventory::{ProductEvent, ProductId, ProductStatus, LOW_STOCK_THRESHOLD};

use crate::read_model::SiteStore;

use super::{ProjectionError, StreamCursors};

/// Queryable catalog entry: the browsing view of a product.
///
/// `stock` is a materialized cache of the ledger sum and `status` is derived
/// from it; neither is ever an independent fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub product_id: ProductId,
    pub sku: Sku,
    pub name: String,
    pub category: String,
    pub unit_cost: i64,
    pub unit_price: i64,
    pub stock: i64,
    pub location: Option<String>,
}

impl CatalogEntry {
    pub fn status(&self) -> ProductStatus {
        if self.stock <= 0 {
            ProductStatus::OutOfStock
        } else if self.stock <= LOW_STOCK_THRESHOLD {
            ProductStatus::LowStock
        } else {
            ProductStatus::Active
        }
    }
}

/// Catalog projection: one entry per (site, product).
#[derive(Debug)]
pub struct CatalogProjection<S>
where
    S: SiteStore<ProductId, CatalogEntry>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> CatalogProjection<S>
where
    S: SiteStore<ProductId, CatalogEntry>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, site_id: SiteId, product_id: &ProductId) -> Option<CatalogEntry> {
        self.store.get(site_id, product_id)
    }

    pub fn list(&self, site_id: SiteId) -> Vec<CatalogEntry> {
        self.store.list(site_id)
    }

    /// Look a product up by its SKU within one site.
    ///
    /// (SKU, site) is the uniqueness key of a catalog entry, so at most one
    /// match exists per site.
    pub fn find_by_sku(&self, site_id: SiteId, sku: &Sku) -> Option<CatalogEntry> {
        self.store
            .list(site_id)
            .into_iter()
            .find(|entry| entry.sku == *sku)
    }

    /// Entries at or below the low-stock threshold (includes out-of-stock).
    pub fn low_stock(&self, site_id: SiteId) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .store
            .list(site_id)
            .into_iter()
            .filter(|e| e.stock <= LOW_STOCK_THRESHOLD)
            .collect();
        entries.sort_by_key(|e| e.stock);
        entries
    }

    /// Apply a published envelope. Idempotent for at-least-once delivery.
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

        // Validate site isolation at the event level.
        let (event_site, product_id) = match &event {
            ProductEvent::ProductCreated(e) => (e.site_id, e.product_id),
            ProductEvent::StockAdjusted(e) => (e.site_id, e.product_id),
            ProductEvent::LocationChanged(e) => (e.site_id, e.product_id),
        };
        if event_site != site_id {
            return Err(ProjectionError::SiteIsolation(
                "event site_id does not match envelope site_id".to_string(),
            ));
        }
        if product_id.0 != aggregate_id {
            return Err(ProjectionError::SiteIsolation(
                "event product_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match event {
            ProductEvent::ProductCreated(e) => {
                self.store.upsert(
                    site_id,
                    e.product_id,
                    CatalogEntry {
                        product_id: e.product_id,
                        sku: e.sku,
                        name: e.name,
                        category: e.category,
                        unit_cost: e.unit_cost,
                        unit_price: e.unit_price,
                        stock: 0,
                        location: e.location,
                    },
                );
            }
            ProductEvent::StockAdjusted(e) => {
                if let Some(mut entry) = self.store.get(site_id, &e.product_id) {
                    entry.stock += e.delta;
                    self.store.upsert(site_id, e.product_id, entry);
                }
            }
            ProductEvent::LocationChanged(e) => {
                if let Some(mut entry) = self.store.get(site_id, &e.product_id) {
                    entry.location = Some(e.location);
                    self.store.upsert(site_id, e.product_id, entry);
                }
            }
        }

        self.cursors.advance(site_id, aggregate_id, seq);
        Ok(())
    }

    /// Rebuild the catalog from scratch by replaying envelopes.
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
