use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{Aggregate, AggregateId, AggregateRoot, DomainError, SiteId, SiteType, Sku};
use stockroom_events::{Command, Event};

use crate::movement::{MovementReason, MovementRef};

/// Catalog entry identifier (site-scoped via `site_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Stock level below (or at) which a product reads as low on stock.
pub const LOW_STOCK_THRESHOLD: i64 = 10;

/// Status derived from quantity; never stored independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    LowStock,
    OutOfStock,
}

/// Aggregate root: Product — a per-(SKU, site) inventory record.
///
/// The stream of `StockAdjusted` events on this aggregate is the stock
/// ledger for the entry. Quantity is never mutated except by applying those
/// events, so `stock == sum(deltas)` holds at every version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    site_id: Option<SiteId>,
    sku: Option<Sku>,
    name: String,
    category: String,
    /// Unit cost/price in the smallest currency unit (e.g. cents).
    unit_cost: i64,
    unit_price: i64,
    stock: i64,
    location: Option<String>,
    version: u64,
    created: bool,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            site_id: None,
            sku: None,
            name: String::new(),
            category: String::new(),
            unit_cost: 0,
            unit_price: 0,
            stock: 0,
            location: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn sku(&self) -> Option<&Sku> {
        self.sku.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn unit_cost(&self) -> i64 {
        self.unit_cost
    }

    pub fn unit_price(&self) -> i64 {
        self.unit_price
    }

    pub fn stock(&self) -> i64 {
        self.stock
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

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

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateProduct.
///
/// Carries the site type so the HQ gate is a pure domain check: catalog
/// entries are never created at administrative sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub site_id: SiteId,
    pub site_type: SiteType,
    pub product_id: ProductId,
    pub sku: Sku,
    pub name: String,
    pub category: String,
    pub unit_cost: i64,
    pub unit_price: i64,
    pub location: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock — the only path that changes quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub site_id: SiteId,
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: Option<MovementRef>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetLocation (shelf/bin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLocation {
    pub site_id: SiteId,
    pub product_id: ProductId,
    pub location: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    AdjustStock(AdjustStock),
    SetLocation(SetLocation),
}

impl Command for ProductCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            ProductCommand::CreateProduct(c) => c.product_id.0,
            ProductCommand::AdjustStock(c) => c.product_id.0,
            ProductCommand::SetLocation(c) => c.product_id.0,
        }
    }
}

/// Event: ProductCreated (zero quantity until the first ledger entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub site_id: SiteId,
    pub product_id: ProductId,
    pub sku: Sku,
    pub name: String,
    pub category: String,
    pub unit_cost: i64,
    pub unit_price: i64,
    pub location: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAdjusted — one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub site_id: SiteId,
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: Option<MovementRef>,
    /// Set when an ADJUSTMENT was allowed to push the balance below zero;
    /// reconciliation tooling must surface these for audit.
    pub forced: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LocationChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationChanged {
    pub site_id: SiteId,
    pub product_id: ProductId,
    pub location: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductEvent {
    ProductCreated(ProductCreated),
    StockAdjusted(StockAdjusted),
    LocationChanged(LocationChanged),
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::ProductCreated(_) => "inventory.product.created",
            ProductEvent::StockAdjusted(_) => "inventory.product.stock_adjusted",
            ProductEvent::LocationChanged(_) => "inventory.product.location_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::ProductCreated(e) => e.occurred_at,
            ProductEvent::StockAdjusted(e) => e.occurred_at,
            ProductEvent::LocationChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::ProductCreated(e) => {
                self.id = e.product_id;
                self.site_id = Some(e.site_id);
                self.sku = Some(e.sku.clone());
                self.name = e.name.clone();
                self.category = e.category.clone();
                self.unit_cost = e.unit_cost;
                self.unit_price = e.unit_price;
                self.stock = 0;
                self.location = e.location.clone();
                self.created = true;
            }
            ProductEvent::StockAdjusted(e) => {
                self.stock += e.delta;
            }
            ProductEvent::LocationChanged(e) => {
                self.location = Some(e.location.clone());
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductCommand::CreateProduct(cmd) => self.handle_create(cmd),
            ProductCommand::AdjustStock(cmd) => self.handle_adjust(cmd),
            ProductCommand::SetLocation(cmd) => self.handle_set_location(cmd),
        }
    }
}

impl Product {
    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::state_conflict("site mismatch"));
        }
        Ok(())
    }

    fn ensure_product_id(&self, product_id: ProductId) -> Result<(), DomainError> {
        if self.id != product_id {
            return Err(DomainError::state_conflict("product_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }
        if !cmd.site_type.holds_inventory() {
            return Err(DomainError::invalid_site_type(format!(
                "cannot create catalog entry at {:?} site",
                cmd.site_type
            )));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(vec![ProductEvent::ProductCreated(ProductCreated {
            site_id: cmd.site_id,
            product_id: cmd.product_id,
            sku: cmd.sku.clone(),
            name: cmd.name.clone(),
            category: cmd.category.clone(),
            unit_cost: cmd.unit_cost,
            unit_price: cmd.unit_price,
            location: cmd.location.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<ProductEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_product_id(cmd.product_id)?;

        if cmd.delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }

        let new_stock = self.stock + cmd.delta;
        let mut forced = false;
        if new_stock < 0 {
            // Only reconciliation adjustments may force a negative balance,
            // and those entries carry the audit flag.
            if cmd.reason == MovementReason::Adjustment {
                forced = true;
            } else {
                return Err(DomainError::insufficient_stock(-cmd.delta, self.stock));
            }
        }

        Ok(vec![ProductEvent::StockAdjusted(StockAdjusted {
            site_id: cmd.site_id,
            product_id: cmd.product_id,
            delta: cmd.delta,
            reason: cmd.reason,
            reference: cmd.reference,
            forced,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_location(&self, cmd: &SetLocation) -> Result<Vec<ProductEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_product_id(cmd.product_id)?;

        if cmd.location.trim().is_empty() {
            return Err(DomainError::validation("location cannot be empty"));
        }

        Ok(vec![ProductEvent::LocationChanged(LocationChanged {
            site_id: cmd.site_id,
            product_id: cmd.product_id,
            location: cmd.location.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_events::execute;

    fn test_site_id() -> SiteId {
        SiteId::new()
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn created_product(site_id: SiteId, product_id: ProductId) -> Product {
        let mut product = Product::empty(product_id);
        let cmd = ProductCommand::CreateProduct(CreateProduct {
            site_id,
            site_type: SiteType::Warehouse,
            product_id,
            sku: Sku::new("WID-001").unwrap(),
            name: "Widget".to_string(),
            category: "Widgets".to_string(),
            unit_cost: 500,
            unit_price: 900,
            location: Some("A-01-01".to_string()),
            occurred_at: test_time(),
        });
        execute(&mut product, &cmd).unwrap();
        product
    }

    fn adjust(
        product: &Product,
        delta: i64,
        reason: MovementReason,
    ) -> Result<Vec<ProductEvent>, DomainError> {
        product.handle(&ProductCommand::AdjustStock(AdjustStock {
            site_id: product.site_id().unwrap(),
            product_id: product.id_typed(),
            delta,
            reason,
            reference: None,
            occurred_at: test_time(),
        }))
    }

    #[test]
    fn create_rejects_administrative_sites() {
        let product = Product::empty(test_product_id());
        let err = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                site_id: test_site_id(),
                site_type: SiteType::Administrative,
                product_id: test_product_id(),
                sku: Sku::new("WID-001").unwrap(),
                name: "Widget".to_string(),
                category: "Widgets".to_string(),
                unit_cost: 500,
                unit_price: 900,
                location: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidSiteType(_)));
    }

    #[test]
    fn new_product_starts_at_zero_stock_and_out_of_stock() {
        let product = created_product(test_site_id(), test_product_id());
        assert_eq!(product.stock(), 0);
        assert_eq!(product.status(), ProductStatus::OutOfStock);
    }

    #[test]
    fn receive_increases_stock_and_updates_status() {
        let mut product = created_product(test_site_id(), test_product_id());
        let events = adjust(&product, 50, MovementReason::Receive).unwrap();
        for e in &events {
            product.apply(e);
        }
        assert_eq!(product.stock(), 50);
        assert_eq!(product.status(), ProductStatus::Active);
    }

    #[test]
    fn low_stock_threshold_drives_status() {
        let mut product = created_product(test_site_id(), test_product_id());
        for e in adjust(&product, LOW_STOCK_THRESHOLD, MovementReason::Receive).unwrap() {
            product.apply(&e);
        }
        assert_eq!(product.status(), ProductStatus::LowStock);
    }

    #[test]
    fn sale_cannot_drive_balance_negative() {
        let mut product = created_product(test_site_id(), test_product_id());
        for e in adjust(&product, 5, MovementReason::Receive).unwrap() {
            product.apply(&e);
        }

        let err = adjust(&product, -6, MovementReason::Sale).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                requested: 6,
                available: 5
            }
        );
        // Rejected before any mutation.
        assert_eq!(product.stock(), 5);
    }

    #[test]
    fn adjustment_may_force_negative_and_is_flagged() {
        let mut product = created_product(test_site_id(), test_product_id());
        for e in adjust(&product, 5, MovementReason::Receive).unwrap() {
            product.apply(&e);
        }

        let events = adjust(&product, -8, MovementReason::Adjustment).unwrap();
        match &events[0] {
            ProductEvent::StockAdjusted(e) => {
                assert!(e.forced);
                assert_eq!(e.delta, -8);
            }
            other => panic!("expected StockAdjusted, got {other:?}"),
        }
    }

    #[test]
    fn zero_delta_is_rejected() {
        let product = created_product(test_site_id(), test_product_id());
        let err = adjust(&product, 0, MovementReason::Receive).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// After any accepted sequence of adjustments, stock equals the
            /// sum of applied deltas and is never negative (outside forced
            /// adjustments, which this generator does not produce).
            #[test]
            fn stock_is_always_sum_of_applied_deltas(deltas in proptest::collection::vec(-40i64..40, 1..64)) {
                let mut product = created_product(test_site_id(), test_product_id());
                let mut applied_sum = 0i64;

                for delta in deltas {
                    if delta == 0 {
                        continue;
                    }
                    let reason = if delta > 0 { MovementReason::Receive } else { MovementReason::Sale };
                    match adjust(&product, delta, reason) {
                        Ok(events) => {
                            for e in &events {
                                product.apply(e);
                            }
                            applied_sum += delta;
                        }
                        Err(DomainError::InsufficientStock { .. }) => {
                            // Rejected appends must leave state untouched.
                            prop_assert_eq!(product.stock(), applied_sum);
                        }
                        Err(other) => return Err(TestCaseError::fail(format!("{other:?}"))),
                    }
                    prop_assert!(product.stock() >= 0);
                    prop_assert_eq!(product.stock(), applied_sum);
                }
            }
        }
    }
}
