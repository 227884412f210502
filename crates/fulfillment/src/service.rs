//! The fulfillment orchestrator.
//!
//! [`FulfillmentService`] is the one place where aggregates from different
//! crates meet: receiving a purchase order spawns the PUTAWAY job, creating
//! a sale reserves stock and spawns the PICK job, completing a job posts
//! ledger entries and chains the next job. Every cross-aggregate step
//! commits through a single multi-stream append, so the ledger can never
//! half-record an operation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use stockroom_core::{Actor, Aggregate, AggregateId, DomainError, Site, SiteId, Sku};
use stockroom_events::{EventBus, EventEnvelope};
use stockroom_inventory::{
    MovementReason, MovementRef, Product, ProductCommand, ProductEvent, ProductId, StockMovement,
};
use stockroom_purchasing::order as po;
use stockroom_purchasing::{PurchaseOrder, PurchaseOrderId};
use stockroom_sales::sale as sales;
use stockroom_sales::{FulfillmentStatus, Sale, SaleId, SaleLine};
use stockroom_warehouse::job as wms;
use stockroom_warehouse::{
    JobId, JobLineSpec, JobPriority, JobStatus, JobType, OrderRef, WmsJob,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamBatch};
use crate::numbering::NumberAllocator;
use crate::projections::{CatalogEntry, CatalogProjection};
use crate::read_model::SiteStore;
use crate::reconcile::{self, ReconciliationReport};

const AGG_PRODUCT: &str = "inventory.product";
const AGG_PO: &str = "purchasing.po";
const AGG_SALE: &str = "sales.sale";
const AGG_JOB: &str = "warehouse.job";

#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<EventStoreError> for FulfillmentError {
    fn from(value: EventStoreError) -> Self {
        FulfillmentError::Dispatch(DispatchError::from(value))
    }
}

impl From<DomainError> for FulfillmentError {
    fn from(value: DomainError) -> Self {
        FulfillmentError::Dispatch(DispatchError::from(value))
    }
}

/// A requested sale line, before line numbers are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSaleLine {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
}

/// A requested transfer line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// A job line whose product reference no longer resolves to a catalog
/// entry at the job's site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenJobLine {
    pub job_id: JobId,
    pub job_number: String,
    pub line_no: u32,
    pub product_id: ProductId,
    pub sku: Sku,
}

pub struct FulfillmentService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    numbers: NumberAllocator,
}

impl<S, B> FulfillmentService<S, B> {
    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }
}

impl<S, B> FulfillmentService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Build a service over a store, replaying already-issued document
    /// numbers into the allocator so a restarted process continues each
    /// series instead of reissuing numbers from the beginning.
    pub fn new(store: S, bus: B) -> Result<Self, FulfillmentError> {
        let numbers = NumberAllocator::new();
        for stored in store.load_all()? {
            match stored.aggregate_type.as_str() {
                AGG_PO => {
                    if let Ok(po::PurchaseOrderEvent::Created { po_number, .. }) =
                        serde_json::from_value(stored.payload)
                    {
                        numbers.observe_po_number(&po_number);
                    }
                }
                AGG_SALE => {
                    if let Ok(sales::SaleEvent::Created { receipt_number, .. }) =
                        serde_json::from_value(stored.payload)
                    {
                        numbers.observe_receipt_number(&receipt_number);
                    }
                }
                AGG_JOB => {
                    if let Ok(wms::WmsJobEvent::Created {
                        job_number,
                        job_type,
                        ..
                    }) = serde_json::from_value(stored.payload)
                    {
                        numbers.observe_job_number(job_type, &job_number);
                    }
                }
                _ => {}
            }
        }
        Ok(Self {
            dispatcher: CommandDispatcher::new(store, bus),
            numbers,
        })
    }

    // ---- catalog -------------------------------------------------------

    /// Create a catalog entry at a site. Idempotent on SKU: if the site
    /// already carries the SKU the existing entry's id is returned and
    /// nothing is written.
    ///
    /// The site type travels on the command so administrative sites are
    /// rejected inside the aggregate, not by callers remembering to check.
    #[instrument(skip(self, site), fields(site_id = %site.id, sku = %sku), err)]
    pub fn create_product(
        &self,
        site: &Site,
        sku: Sku,
        name: &str,
        category: &str,
        unit_cost: i64,
        unit_price: i64,
        location: Option<String>,
    ) -> Result<ProductId, FulfillmentError> {
        if let Some((existing, _)) = self.find_product_by_sku(site.id, &sku)? {
            return Ok(existing.id_typed());
        }

        let product_id = ProductId::new(AggregateId::new());
        self.dispatcher.dispatch(
            site.id,
            product_id.0,
            AGG_PRODUCT,
            &ProductCommand::CreateProduct(stockroom_inventory::CreateProduct {
                site_id: site.id,
                site_type: site.site_type,
                product_id,
                sku,
                name: name.to_string(),
                category: category.to_string(),
                unit_cost,
                unit_price,
                location,
                occurred_at: Utc::now(),
            }),
            |id| Product::empty(ProductId(id)),
        )?;
        Ok(product_id)
    }

    /// Replicate a catalog entry's SKU to another site (zero stock there
    /// until goods actually move). Idempotent: an existing entry with the
    /// same SKU at the destination is returned as-is.
    #[instrument(skip(self, dest), fields(source_site = %source_site, dest_site = %dest.id), err)]
    pub fn replicate_product(
        &self,
        source_site: SiteId,
        product_id: ProductId,
        dest: &Site,
    ) -> Result<ProductId, FulfillmentError> {
        let (product, _) = self.load_product(source_site, product_id)?;
        let sku = product
            .sku()
            .cloned()
            .ok_or(DispatchError::NotFound)?;

        if let Some((existing, _)) = self.find_product_by_sku(dest.id, &sku)? {
            return Ok(existing.id_typed());
        }

        self.create_product(
            dest,
            sku,
            product.name(),
            product.category(),
            product.unit_cost(),
            product.unit_price(),
            product.location().map(str::to_string),
        )
    }

    /// Manual stock correction. The only operation allowed to force a
    /// balance below zero; every entry it writes is audit-flagged.
    #[instrument(skip(self), fields(site_id = %site_id, %product_id, delta), err)]
    pub fn record_adjustment(
        &self,
        site_id: SiteId,
        product_id: ProductId,
        delta: i64,
    ) -> Result<(), FulfillmentError> {
        self.dispatcher.dispatch(
            site_id,
            product_id.0,
            AGG_PRODUCT,
            &ProductCommand::AdjustStock(stockroom_inventory::AdjustStock {
                site_id,
                product_id,
                delta,
                reason: MovementReason::Adjustment,
                reference: None,
                occurred_at: Utc::now(),
            }),
            |id| Product::empty(ProductId(id)),
        )?;
        Ok(())
    }

    pub fn set_product_location(
        &self,
        site_id: SiteId,
        product_id: ProductId,
        location: &str,
    ) -> Result<(), FulfillmentError> {
        self.dispatcher.dispatch(
            site_id,
            product_id.0,
            AGG_PRODUCT,
            &ProductCommand::SetLocation(stockroom_inventory::SetLocation {
                site_id,
                product_id,
                location: location.to_string(),
                occurred_at: Utc::now(),
            }),
            |id| Product::empty(ProductId(id)),
        )?;
        Ok(())
    }

    pub fn product(
        &self,
        site_id: SiteId,
        product_id: ProductId,
    ) -> Result<Option<Product>, FulfillmentError> {
        let (product, _) = self
            .dispatcher
            .load_aggregate(site_id, product_id.0, |id| Product::empty(ProductId(id)))?;
        Ok(product.is_created().then_some(product))
    }

    /// Movement history for one product, read straight off its stream.
    pub fn movement_history(
        &self,
        site_id: SiteId,
        product_id: ProductId,
    ) -> Result<Vec<StockMovement>, FulfillmentError> {
        let stream = self.dispatcher.store().load_stream(site_id, product_id.0)?;
        let mut history = Vec::new();
        for stored in &stream {
            let event: ProductEvent = serde_json::from_value(stored.payload.clone())
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            if let ProductEvent::StockAdjusted(e) = event {
                history.push(StockMovement {
                    product_id: e.product_id,
                    delta: e.delta,
                    reason: e.reason,
                    reference: e.reference,
                    forced: e.forced,
                    occurred_at: e.occurred_at,
                });
            }
        }
        Ok(history)
    }

    // ---- purchasing ----------------------------------------------------

    #[instrument(skip(self), fields(site_id = %site_id), err)]
    pub fn create_purchase_order(
        &self,
        site_id: SiteId,
        supplier_name: &str,
        notes: Option<String>,
    ) -> Result<PurchaseOrderId, FulfillmentError> {
        let order_id = PurchaseOrderId::new(AggregateId::new());
        let po_number = self.numbers.next_po_number();
        self.dispatcher.dispatch(
            site_id,
            order_id.0,
            AGG_PO,
            &po::PurchaseOrderCommand::CreatePurchaseOrder(po::CreatePurchaseOrder {
                site_id,
                order_id,
                po_number,
                supplier_name: supplier_name.to_string(),
                notes,
                occurred_at: Utc::now(),
            }),
            |id| PurchaseOrder::empty(PurchaseOrderId(id)),
        )?;
        Ok(order_id)
    }

    pub fn add_po_line(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
        product_id: Option<ProductId>,
        product_name: &str,
        quantity: i64,
        unit_cost: i64,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_po(
            site_id,
            order_id,
            po::PurchaseOrderCommand::AddLine(po::AddLine {
                site_id,
                order_id,
                product_id,
                product_name: product_name.to_string(),
                quantity,
                unit_cost,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn submit_po(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_po(
            site_id,
            order_id,
            po::PurchaseOrderCommand::Submit(po::Submit {
                site_id,
                order_id,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn approve_po(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
        approved_by: Actor,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_po(
            site_id,
            order_id,
            po::PurchaseOrderCommand::Approve(po::Approve {
                site_id,
                order_id,
                approved_by,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn link_po_line(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
        line_no: u32,
        product_id: ProductId,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_po(
            site_id,
            order_id,
            po::PurchaseOrderCommand::LinkLineProduct(po::LinkLineProduct {
                site_id,
                order_id,
                line_no,
                product_id,
                occurred_at: Utc::now(),
            }),
        )
    }

    /// Receive an approved purchase order and spawn its PUTAWAY job.
    ///
    /// The `Received` flip and the `JobCreated` events commit in one
    /// multi-stream append, so there is no window where the order is
    /// received but no putaway exists. Re-receiving is a no-op success that
    /// returns the already-active putaway job, if any.
    #[instrument(skip(self), fields(site_id = %site_id, %order_id), err)]
    pub fn receive_purchase_order(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<JobId>, FulfillmentError> {
        let now = Utc::now();
        let (order, order_version) = self.dispatcher.load_aggregate(site_id, order_id.0, |id| {
            PurchaseOrder::empty(PurchaseOrderId(id))
        })?;

        let receive_batch = self.dispatcher.stage(
            site_id,
            order_id.0,
            AGG_PO,
            &order,
            order_version,
            &po::PurchaseOrderCommand::Receive(po::Receive {
                site_id,
                order_id,
                occurred_at: now,
            }),
        )?;

        let Some(receive_batch) = receive_batch else {
            // Duplicate receive. Surface the putaway that already exists.
            return Ok(self
                .find_active_job(site_id, OrderRef::PurchaseOrder(order_id.0), JobType::Putaway)?
                .map(|(job, _)| job.id_typed()));
        };

        // Build the putaway from the resolved PO lines. The Receive guard
        // has already rejected unresolved lines.
        let mut lines = Vec::with_capacity(order.lines().len());
        for line in order.lines() {
            let product_id = line
                .product_id
                .ok_or_else(|| DomainError::unresolved(line.product_name.clone()))?;
            let (product, _) = self.load_product(site_id, product_id)?;
            let sku = product.sku().cloned().ok_or(DispatchError::NotFound)?;
            lines.push(JobLineSpec {
                product_id,
                sku,
                product_name: product.name().to_string(),
                expected_qty: line.quantity,
            });
        }

        let (job_id, job_batch) = self.stage_new_job(
            site_id,
            JobType::Putaway,
            JobPriority::Normal,
            Some(OrderRef::PurchaseOrder(order_id.0)),
            lines,
            None,
            None,
            now,
        )?;

        self.dispatcher.commit(vec![receive_batch, job_batch])?;
        info!(%order_id, %job_id, "purchase order received, putaway spawned");
        Ok(Some(job_id))
    }

    /// Cancel a purchase order and any active jobs it spawned.
    #[instrument(skip(self), fields(site_id = %site_id, %order_id), err)]
    pub fn cancel_purchase_order(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
        reason: Option<String>,
    ) -> Result<(), FulfillmentError> {
        let now = Utc::now();
        self.dispatch_po(
            site_id,
            order_id,
            po::PurchaseOrderCommand::Cancel(po::Cancel {
                site_id,
                order_id,
                reason: reason.clone(),
                occurred_at: now,
            }),
        )?;

        // Draft/Pending/Approved orders have no jobs yet in the normal
        // path, but a reversal can leave one behind.
        if let Some((job, version)) =
            self.find_active_job(site_id, OrderRef::PurchaseOrder(order_id.0), JobType::Putaway)?
        {
            let batch = self.dispatcher.stage(
                site_id,
                job.id_typed().0,
                AGG_JOB,
                &job,
                version,
                &wms::WmsJobCommand::Cancel(wms::Cancel {
                    site_id,
                    job_id: job.id_typed(),
                    reason,
                    occurred_at: now,
                }),
            )?;
            if let Some(batch) = batch {
                self.dispatcher.commit(vec![batch])?;
            }
        }
        Ok(())
    }

    /// Administrative rollback of a receipt (Received → Approved).
    ///
    /// Cancels the putaway if it is still running; if it already completed,
    /// writes negative compensating adjustments (audit-flagged) for the
    /// quantities that were posted.
    #[instrument(skip(self), fields(site_id = %site_id, %order_id), err)]
    pub fn reverse_receipt(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
        reversed_by: Actor,
    ) -> Result<(), FulfillmentError> {
        let now = Utc::now();
        let (order, order_version) = self.dispatcher.load_aggregate(site_id, order_id.0, |id| {
            PurchaseOrder::empty(PurchaseOrderId(id))
        })?;

        let Some(reverse_batch) = self.dispatcher.stage(
            site_id,
            order_id.0,
            AGG_PO,
            &order,
            order_version,
            &po::PurchaseOrderCommand::ReverseReceipt(po::ReverseReceipt {
                site_id,
                order_id,
                reversed_by,
                occurred_at: now,
            }),
        )?
        else {
            return Ok(());
        };

        let mut batches = vec![reverse_batch];
        let order_ref = OrderRef::PurchaseOrder(order_id.0);

        if let Some((job, version)) = self.find_job_for(site_id, order_ref, JobType::Putaway)? {
            if job.status() == JobStatus::Completed {
                // The putaway posted RECEIVE entries; compensate them.
                let mut deltas: HashMap<ProductId, i64> = HashMap::new();
                for line in job.lines() {
                    if line.fulfilled_qty > 0 {
                        *deltas.entry(line.product_id).or_insert(0) -= line.fulfilled_qty;
                    }
                }
                self.stage_adjustments(
                    site_id,
                    deltas,
                    MovementReason::Adjustment,
                    Some(MovementRef::PurchaseOrder(order_id.0)),
                    now,
                    &mut batches,
                )?;
                warn!(%order_id, job_number = job.job_number(), "receipt reversed after putaway completion; compensating adjustments written");
            } else if !job.status().is_terminal() {
                let batch = self.dispatcher.stage(
                    site_id,
                    job.id_typed().0,
                    AGG_JOB,
                    &job,
                    version,
                    &wms::WmsJobCommand::Cancel(wms::Cancel {
                        site_id,
                        job_id: job.id_typed(),
                        reason: Some("receipt reversed".to_string()),
                        occurred_at: now,
                    }),
                )?;
                batches.extend(batch);
            }
        }

        self.dispatcher.commit(batches)?;
        Ok(())
    }

    pub fn purchase_order(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, FulfillmentError> {
        let (order, _) = self
            .dispatcher
            .load_aggregate(site_id, order_id.0, |id| {
                PurchaseOrder::empty(PurchaseOrderId(id))
            })?;
        Ok(order.is_created().then_some(order))
    }

    // ---- sales ---------------------------------------------------------

    /// Create a sale: reserve stock and spawn the PICK job.
    ///
    /// Stock is decremented exactly once, here, with reason `SALE`. The
    /// reservation, the sale record, and the pick commit atomically; an
    /// insufficient balance on any line aborts the whole sale.
    #[instrument(skip(self, lines), fields(site_id = %site_id, line_count = lines.len()), err)]
    pub fn create_sale(
        &self,
        site_id: SiteId,
        lines: Vec<NewSaleLine>,
    ) -> Result<(SaleId, JobId), FulfillmentError> {
        if lines.is_empty() {
            return Err(FulfillmentError::Validation(
                "a sale needs at least one line".to_string(),
            ));
        }

        let now = Utc::now();
        let sale_id = SaleId::new(AggregateId::new());
        let receipt_number = self.numbers.next_receipt_number();

        // Reservation: one adjustment per product, summed across lines.
        let mut deltas: HashMap<ProductId, i64> = HashMap::new();
        for line in &lines {
            if line.quantity <= 0 {
                return Err(FulfillmentError::Validation(
                    "sale quantity must be positive".to_string(),
                ));
            }
            *deltas.entry(line.product_id).or_insert(0) -= line.quantity;
        }

        let mut batches = Vec::new();
        let mut job_lines = Vec::with_capacity(lines.len());
        let mut sale_lines = Vec::with_capacity(lines.len());

        for (idx, line) in lines.iter().enumerate() {
            let (product, _) = self.load_product(site_id, line.product_id)?;
            let sku = product.sku().cloned().ok_or(DispatchError::NotFound)?;
            job_lines.push(JobLineSpec {
                product_id: line.product_id,
                sku,
                product_name: product.name().to_string(),
                expected_qty: line.quantity,
            });
            sale_lines.push(SaleLine {
                line_no: (idx as u32) + 1,
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
            });
        }

        self.stage_adjustments(
            site_id,
            deltas,
            MovementReason::Sale,
            Some(MovementRef::Sale(sale_id.0)),
            now,
            &mut batches,
        )?;

        let sale = Sale::empty(sale_id);
        let sale_batch = self.dispatcher.stage(
            site_id,
            sale_id.0,
            AGG_SALE,
            &sale,
            0,
            &sales::SaleCommand::CreateSale(sales::CreateSale {
                site_id,
                sale_id,
                receipt_number,
                lines: sale_lines,
                occurred_at: now,
            }),
        )?;
        batches.extend(sale_batch);

        let (job_id, job_batch) = self.stage_new_job(
            site_id,
            JobType::Pick,
            JobPriority::High,
            Some(OrderRef::Sale(sale_id.0)),
            job_lines,
            None,
            None,
            now,
        )?;
        batches.push(job_batch);

        self.dispatcher.commit(batches)?;
        info!(%sale_id, %job_id, "sale created, stock reserved, pick spawned");
        Ok((sale_id, job_id))
    }

    pub fn sale(&self, site_id: SiteId, sale_id: SaleId) -> Result<Option<Sale>, FulfillmentError> {
        let (sale, _) = self
            .dispatcher
            .load_aggregate(site_id, sale_id.0, |id| Sale::empty(SaleId(id)))?;
        Ok(sale.is_created().then_some(sale))
    }

    // ---- warehouse jobs ------------------------------------------------

    pub fn assign_job(
        &self,
        site_id: SiteId,
        job_id: JobId,
        assignee: Actor,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_job(
            site_id,
            job_id,
            wms::WmsJobCommand::Assign(wms::Assign {
                site_id,
                job_id,
                assignee,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn start_job(&self, site_id: SiteId, job_id: JobId) -> Result<(), FulfillmentError> {
        self.dispatch_job(
            site_id,
            job_id,
            wms::WmsJobCommand::Start(wms::Start {
                site_id,
                job_id,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn record_job_line(
        &self,
        site_id: SiteId,
        job_id: JobId,
        line_no: u32,
        quantity: i64,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_job(
            site_id,
            job_id,
            wms::WmsJobCommand::RecordFulfillment(wms::RecordFulfillment {
                site_id,
                job_id,
                line_no,
                quantity,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn cancel_job(
        &self,
        site_id: SiteId,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<(), FulfillmentError> {
        self.dispatch_job(
            site_id,
            job_id,
            wms::WmsJobCommand::Cancel(wms::Cancel {
                site_id,
                job_id,
                reason,
                occurred_at: Utc::now(),
            }),
        )
    }

    /// Return a stuck job to Pending: clears the assignee and zeroes the
    /// fulfilled quantities. Nothing was ledgered before completion, so a
    /// reset never touches stock.
    #[instrument(skip(self), fields(site_id = %site_id, %job_id), err)]
    pub fn reset_job(&self, site_id: SiteId, job_id: JobId) -> Result<(), FulfillmentError> {
        self.dispatch_job(
            site_id,
            job_id,
            wms::WmsJobCommand::Reset(wms::Reset {
                site_id,
                job_id,
                occurred_at: Utc::now(),
            }),
        )
    }

    /// Create a TRANSFER job moving stock between two sites.
    ///
    /// Both sites must already carry catalog entries for every SKU; use
    /// [`Self::replicate_product`] first when the destination is new.
    #[instrument(skip(self, lines), fields(source = %source_site, dest = %dest_site), err)]
    pub fn create_transfer_job(
        &self,
        source_site: SiteId,
        dest_site: SiteId,
        lines: Vec<TransferLine>,
        priority: JobPriority,
    ) -> Result<JobId, FulfillmentError> {
        let now = Utc::now();
        let mut specs = Vec::with_capacity(lines.len());
        for line in &lines {
            let (product, _) = self.load_product(source_site, line.product_id)?;
            let sku = product.sku().cloned().ok_or(DispatchError::NotFound)?;
            // Fail at creation rather than completion when the destination
            // has never seen this SKU.
            if self.find_product_by_sku(dest_site, &sku)?.is_none() {
                return Err(DomainError::unresolved(format!(
                    "destination site has no catalog entry for {sku}"
                ))
                .into());
            }
            specs.push(JobLineSpec {
                product_id: line.product_id,
                sku,
                product_name: product.name().to_string(),
                expected_qty: line.quantity,
            });
        }

        let (job_id, batch) = self.stage_new_job(
            source_site,
            JobType::Transfer,
            priority,
            None,
            specs,
            Some(source_site),
            Some(dest_site),
            now,
        )?;
        self.dispatcher.commit(vec![batch])?;
        info!(%job_id, "transfer job created");
        Ok(job_id)
    }

    /// Complete a job and run its per-type side effects atomically.
    ///
    /// Returns the chained job (PACK after PICK, DISPATCH after PACK) when
    /// one is spawned.
    #[instrument(skip(self), fields(site_id = %site_id, %job_id), err)]
    pub fn complete_job(
        &self,
        site_id: SiteId,
        job_id: JobId,
        short_close_reason: Option<String>,
    ) -> Result<Option<JobId>, FulfillmentError> {
        let now = Utc::now();
        let (job, job_version) =
            self.dispatcher
                .load_aggregate(site_id, job_id.0, |id| WmsJob::empty(JobId(id)))?;

        let Some(complete_batch) = self.dispatcher.stage(
            site_id,
            job_id.0,
            AGG_JOB,
            &job,
            job_version,
            &wms::WmsJobCommand::Complete(wms::Complete {
                site_id,
                job_id,
                short_close_reason: short_close_reason.clone(),
                occurred_at: now,
            }),
        )?
        else {
            return Ok(None);
        };

        let mut batches = vec![complete_batch];
        let mut chained = None;

        match job.job_type() {
            JobType::Putaway => {
                let mut deltas: HashMap<ProductId, i64> = HashMap::new();
                for line in job.lines() {
                    if line.fulfilled_qty > 0 {
                        *deltas.entry(line.product_id).or_insert(0) += line.fulfilled_qty;
                    }
                }
                self.stage_adjustments(
                    site_id,
                    deltas,
                    MovementReason::Receive,
                    Some(MovementRef::Job(job_id.0)),
                    now,
                    &mut batches,
                )?;
            }
            JobType::Pick => {
                // Stock was reserved at sale creation; a pick moves goods,
                // not balances.
                self.stage_sale_advance(site_id, &job, FulfillmentStatus::Packing, now, &mut batches)?;
                chained = self.stage_chained_job(site_id, &job, JobType::Pack, now, &mut batches)?;
            }
            JobType::Pack => {
                self.stage_sale_advance(site_id, &job, FulfillmentStatus::Shipped, now, &mut batches)?;
                chained =
                    self.stage_chained_job(site_id, &job, JobType::Dispatch, now, &mut batches)?;
            }
            JobType::Dispatch => {
                self.stage_sale_advance(
                    site_id,
                    &job,
                    FulfillmentStatus::Completed,
                    now,
                    &mut batches,
                )?;
            }
            JobType::Transfer => {
                self.stage_transfer_movements(&job, now, &mut batches)?;
            }
        }

        self.dispatcher.commit(batches)?;
        info!(job_number = job.job_number(), chained = ?chained, "job completed");
        Ok(chained)
    }

    pub fn job(&self, site_id: SiteId, job_id: JobId) -> Result<Option<WmsJob>, FulfillmentError> {
        let (job, _) = self
            .dispatcher
            .load_aggregate(site_id, job_id.0, |id| WmsJob::empty(JobId(id)))?;
        Ok(job.is_created().then_some(job))
    }

    // ---- maintenance ---------------------------------------------------

    /// Scan a site's active jobs for lines whose products no longer resolve.
    #[instrument(skip(self), fields(site_id = %site_id), err)]
    pub fn scan_broken_jobs(
        &self,
        site_id: SiteId,
    ) -> Result<Vec<BrokenJobLine>, FulfillmentError> {
        let mut broken = Vec::new();
        for (job, _) in self.load_jobs(site_id)? {
            if job.status().is_terminal() {
                continue;
            }
            for line in job.lines() {
                let exists = self
                    .product(site_id, line.product_id)?
                    .is_some();
                if !exists {
                    warn!(
                        job_number = job.job_number(),
                        line_no = line.line_no,
                        sku = %line.sku,
                        "job line references missing product"
                    );
                    broken.push(BrokenJobLine {
                        job_id: job.id_typed(),
                        job_number: job.job_number().to_string(),
                        line_no: line.line_no,
                        product_id: line.product_id,
                        sku: line.sku.clone(),
                    });
                }
            }
        }
        Ok(broken)
    }

    /// Repair a broken line by pointing it at an existing catalog entry.
    pub fn repair_job_line(
        &self,
        site_id: SiteId,
        job_id: JobId,
        line_no: u32,
        product_id: ProductId,
    ) -> Result<(), FulfillmentError> {
        let (product, _) = self.load_product(site_id, product_id)?;
        let sku = product.sku().cloned().ok_or(DispatchError::NotFound)?;
        self.dispatch_job(
            site_id,
            job_id,
            wms::WmsJobCommand::RelinkLine(wms::RelinkLine {
                site_id,
                job_id,
                line_no,
                product_id,
                sku,
                product_name: product.name().to_string(),
                occurred_at: Utc::now(),
            }),
        )
    }

    /// Remove a broken job that cannot be repaired.
    pub fn remove_broken_job(
        &self,
        site_id: SiteId,
        job_id: JobId,
    ) -> Result<(), FulfillmentError> {
        self.cancel_job(site_id, job_id, Some("broken line items".to_string()))
    }

    /// Recompute every product balance from its movements and report drift.
    #[instrument(skip(self), fields(site_id = %site_id), err)]
    pub fn reconcile_site(&self, site_id: SiteId) -> Result<ReconciliationReport, FulfillmentError> {
        let mut report = ReconciliationReport::default();
        for (product, _) in self.load_products(site_id)? {
            let movements = self.movement_history(site_id, product.id_typed())?;
            reconcile::check_product(&product, &movements, &mut report.findings);
        }
        for finding in &report.findings {
            warn!(?finding, "reconciliation finding");
        }
        Ok(report)
    }

    /// Check a catalog read model against ledger balances.
    ///
    /// Drift means the projection fell behind or was corrupted and needs a
    /// rebuild; the ledger is never patched to match the catalog.
    #[instrument(skip(self, catalog), fields(site_id = %site_id), err)]
    pub fn reconcile_catalog<C>(
        &self,
        site_id: SiteId,
        catalog: &CatalogProjection<C>,
    ) -> Result<ReconciliationReport, FulfillmentError>
    where
        C: SiteStore<ProductId, CatalogEntry>,
    {
        let mut report = ReconciliationReport::default();
        for entry in catalog.list(site_id) {
            let ledger_sum: i64 = self
                .movement_history(site_id, entry.product_id)?
                .iter()
                .map(|m| m.delta)
                .sum();
            reconcile::check_catalog_entry(&entry, ledger_sum, &mut report.findings);
        }
        for finding in &report.findings {
            warn!(?finding, "catalog drift");
        }
        Ok(report)
    }

    // ---- internals -----------------------------------------------------

    fn dispatch_po(
        &self,
        site_id: SiteId,
        order_id: PurchaseOrderId,
        command: po::PurchaseOrderCommand,
    ) -> Result<(), FulfillmentError> {
        self.dispatcher
            .dispatch(site_id, order_id.0, AGG_PO, &command, |id| {
                PurchaseOrder::empty(PurchaseOrderId(id))
            })?;
        Ok(())
    }

    fn dispatch_job(
        &self,
        site_id: SiteId,
        job_id: JobId,
        command: wms::WmsJobCommand,
    ) -> Result<(), FulfillmentError> {
        self.dispatcher
            .dispatch(site_id, job_id.0, AGG_JOB, &command, |id| {
                WmsJob::empty(JobId(id))
            })?;
        Ok(())
    }

    fn load_product(
        &self,
        site_id: SiteId,
        product_id: ProductId,
    ) -> Result<(Product, u64), FulfillmentError> {
        let (product, version) = self
            .dispatcher
            .load_aggregate(site_id, product_id.0, |id| Product::empty(ProductId(id)))?;
        if !product.is_created() {
            return Err(DispatchError::NotFound.into());
        }
        Ok((product, version))
    }

    /// Stage one `AdjustStock` per product for the given summed deltas.
    fn stage_adjustments(
        &self,
        site_id: SiteId,
        deltas: HashMap<ProductId, i64>,
        reason: MovementReason,
        reference: Option<MovementRef>,
        occurred_at: DateTime<Utc>,
        batches: &mut Vec<StreamBatch>,
    ) -> Result<(), FulfillmentError> {
        for (product_id, delta) in deltas {
            if delta == 0 {
                continue;
            }
            let (product, version) = self.load_product(site_id, product_id)?;
            let batch = self.dispatcher.stage(
                site_id,
                product_id.0,
                AGG_PRODUCT,
                &product,
                version,
                &ProductCommand::AdjustStock(stockroom_inventory::AdjustStock {
                    site_id,
                    product_id,
                    delta,
                    reason,
                    reference,
                    occurred_at,
                }),
            )?;
            batches.extend(batch);
        }
        Ok(())
    }

    /// Stage creation of a new job against a fresh stream.
    #[allow(clippy::too_many_arguments)]
    fn stage_new_job(
        &self,
        site_id: SiteId,
        job_type: JobType,
        priority: JobPriority,
        order_ref: Option<OrderRef>,
        lines: Vec<JobLineSpec>,
        source_site_id: Option<SiteId>,
        dest_site_id: Option<SiteId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<(JobId, StreamBatch), FulfillmentError> {
        let job_id = JobId::new(AggregateId::new());
        let job = WmsJob::empty(job_id);
        let batch = self
            .dispatcher
            .stage(
                site_id,
                job_id.0,
                AGG_JOB,
                &job,
                0,
                &wms::WmsJobCommand::CreateJob(wms::CreateJob {
                    site_id,
                    job_id,
                    job_number: self.numbers.next_job_number(job_type),
                    job_type,
                    priority,
                    order_ref,
                    lines,
                    source_site_id,
                    dest_site_id,
                    occurred_at,
                }),
            )?
            .ok_or_else(|| {
                FulfillmentError::Validation("job creation produced no events".to_string())
            })?;
        Ok((job_id, batch))
    }

    /// Advance the sale a completed job belongs to.
    ///
    /// Advancement is idempotent in the aggregate, so replays stage nothing.
    fn stage_sale_advance(
        &self,
        site_id: SiteId,
        job: &WmsJob,
        to: FulfillmentStatus,
        occurred_at: DateTime<Utc>,
        batches: &mut Vec<StreamBatch>,
    ) -> Result<(), FulfillmentError> {
        let Some(OrderRef::Sale(sale_agg)) = job.order_ref() else {
            return Ok(());
        };
        let sale_id = SaleId(sale_agg);
        let (sale, version) = self
            .dispatcher
            .load_aggregate(site_id, sale_agg, |id| Sale::empty(SaleId(id)))?;
        let batch = self.dispatcher.stage(
            site_id,
            sale_agg,
            AGG_SALE,
            &sale,
            version,
            &sales::SaleCommand::AdvanceFulfillment(sales::AdvanceFulfillment {
                site_id,
                sale_id,
                to,
                occurred_at,
            }),
        )?;
        batches.extend(batch);
        Ok(())
    }

    /// Spawn the next job in the PICK → PACK → DISPATCH chain, carrying the
    /// completed job's fulfilled quantities forward as expectations.
    fn stage_chained_job(
        &self,
        site_id: SiteId,
        completed: &WmsJob,
        next_type: JobType,
        occurred_at: DateTime<Utc>,
        batches: &mut Vec<StreamBatch>,
    ) -> Result<Option<JobId>, FulfillmentError> {
        let lines: Vec<JobLineSpec> = completed
            .lines()
            .iter()
            .filter(|l| l.fulfilled_qty > 0)
            .map(|l| JobLineSpec {
                product_id: l.product_id,
                sku: l.sku.clone(),
                product_name: l.product_name.clone(),
                expected_qty: l.fulfilled_qty,
            })
            .collect();

        // A fully short-closed job carries nothing forward.
        if lines.is_empty() {
            return Ok(None);
        }

        let (job_id, batch) = self.stage_new_job(
            site_id,
            next_type,
            completed.priority(),
            completed.order_ref(),
            lines,
            None,
            None,
            occurred_at,
        )?;
        batches.push(batch);
        Ok(Some(job_id))
    }

    /// Stage the paired TRANSFER_OUT / TRANSFER_IN movements of a transfer.
    ///
    /// Both sides share one timestamp and commit in the same append as the
    /// job completion.
    fn stage_transfer_movements(
        &self,
        job: &WmsJob,
        occurred_at: DateTime<Utc>,
        batches: &mut Vec<StreamBatch>,
    ) -> Result<(), FulfillmentError> {
        let source = job
            .source_site_id()
            .ok_or_else(|| FulfillmentError::Validation("transfer has no source site".into()))?;
        let dest = job
            .dest_site_id()
            .ok_or_else(|| FulfillmentError::Validation("transfer has no destination site".into()))?;
        let job_ref = Some(MovementRef::Job(job.id_typed().0));

        let mut out_deltas: HashMap<ProductId, i64> = HashMap::new();
        let mut in_deltas: HashMap<ProductId, i64> = HashMap::new();
        for line in job.lines() {
            if line.fulfilled_qty == 0 {
                continue;
            }
            *out_deltas.entry(line.product_id).or_insert(0) -= line.fulfilled_qty;

            let (dest_product, _) = self
                .find_product_by_sku(dest, &line.sku)?
                .ok_or_else(|| {
                    DomainError::unresolved(format!(
                        "destination site has no catalog entry for {}",
                        line.sku
                    ))
                })?;
            *in_deltas.entry(dest_product.id_typed()).or_insert(0) += line.fulfilled_qty;
        }

        self.stage_adjustments(
            source,
            out_deltas,
            MovementReason::TransferOut,
            job_ref,
            occurred_at,
            batches,
        )?;
        self.stage_adjustments(
            dest,
            in_deltas,
            MovementReason::TransferIn,
            job_ref,
            occurred_at,
            batches,
        )?;
        Ok(())
    }

    fn find_job_for(
        &self,
        site_id: SiteId,
        order_ref: OrderRef,
        job_type: JobType,
    ) -> Result<Option<(WmsJob, u64)>, FulfillmentError> {
        let mut jobs = self.load_jobs(site_id)?;
        // Newest first so the live job wins over older cancelled ones.
        jobs.reverse();
        Ok(jobs.into_iter().find(|(job, _)| {
            job.job_type() == job_type && job.order_ref() == Some(order_ref)
        }))
    }

    fn find_active_job(
        &self,
        site_id: SiteId,
        order_ref: OrderRef,
        job_type: JobType,
    ) -> Result<Option<(WmsJob, u64)>, FulfillmentError> {
        Ok(self.load_jobs(site_id)?.into_iter().find(|(job, _)| {
            job.job_type() == job_type
                && job.order_ref() == Some(order_ref)
                && !job.status().is_terminal()
        }))
    }

    fn load_jobs(&self, site_id: SiteId) -> Result<Vec<(WmsJob, u64)>, FulfillmentError> {
        self.rehydrate_site(site_id, AGG_JOB, |id| WmsJob::empty(JobId(id)))
    }

    fn load_products(&self, site_id: SiteId) -> Result<Vec<(Product, u64)>, FulfillmentError> {
        self.rehydrate_site(site_id, AGG_PRODUCT, |id| Product::empty(ProductId(id)))
    }

    /// Rehydrate every aggregate of one type at a site. Scan path only.
    fn rehydrate_site<A>(
        &self,
        site_id: SiteId,
        aggregate_type: &str,
        make: impl Fn(AggregateId) -> A,
    ) -> Result<Vec<(A, u64)>, FulfillmentError>
    where
        A: Aggregate,
        A::Event: serde::de::DeserializeOwned,
    {
        let events = self.dispatcher.store().load_site(site_id)?;
        let mut grouped: Vec<(AggregateId, Vec<&StoredEvent>)> = Vec::new();
        for stored in &events {
            if stored.aggregate_type != aggregate_type {
                continue;
            }
            match grouped.last_mut() {
                Some((id, stream)) if *id == stored.aggregate_id => stream.push(stored),
                _ => grouped.push((stored.aggregate_id, vec![stored])),
            }
        }

        let mut result = Vec::with_capacity(grouped.len());
        for (id, stream) in grouped {
            let mut aggregate = make(id);
            for stored in &stream {
                let ev: A::Event = serde_json::from_value(stored.payload.clone())
                    .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
                aggregate.apply(&ev);
            }
            let version = stream.last().map(|e| e.sequence_number).unwrap_or(0);
            result.push((aggregate, version));
        }
        Ok(result)
    }

    fn find_product_by_sku(
        &self,
        site_id: SiteId,
        sku: &Sku,
    ) -> Result<Option<(Product, u64)>, FulfillmentError> {
        Ok(self
            .load_products(site_id)?
            .into_iter()
            .find(|(p, _)| p.sku() == Some(sku)))
    }
}
