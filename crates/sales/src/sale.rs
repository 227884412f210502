use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{Aggregate, AggregateId, AggregateRoot, DomainError, SiteId};
use stockroom_events::{Command, Event};
use stockroom_inventory::ProductId;

/// Sale identifier (site-scoped via `site_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaleId(pub AggregateId);

impl SaleId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SaleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Warehouse-side fulfillment lifecycle of a sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentStatus {
    Picking,
    Packing,
    Shipped,
    Completed,
}

/// Sale line: product, quantity, unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    /// Price in the smallest currency unit.
    pub unit_price: i64,
}

/// Aggregate root: Sale.
///
/// Stock is reserved (ledgered with reason SALE) when the sale is created;
/// the PICK → PACK → DISPATCH chain tracks physical movement separately and
/// never decrements stock a second time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    id: SaleId,
    site_id: Option<SiteId>,
    receipt_number: String,
    lines: Vec<SaleLine>,
    fulfillment_status: FulfillmentStatus,
    version: u64,
    created: bool,
}

impl Sale {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: SaleId) -> Self {
        Self {
            id,
            site_id: None,
            receipt_number: String::new(),
            lines: Vec::new(),
            fulfillment_status: FulfillmentStatus::Picking,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SaleId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn receipt_number(&self) -> &str {
        &self.receipt_number
    }

    pub fn lines(&self) -> &[SaleLine] {
        &self.lines
    }

    pub fn fulfillment_status(&self) -> FulfillmentStatus {
        self.fulfillment_status
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Sale {
    type Id = SaleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateSale (invoked by the POS boundary with resolved lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSale {
    pub site_id: SiteId,
    pub sale_id: SaleId,
    pub receipt_number: String,
    pub lines: Vec<SaleLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdvanceFulfillment — move the lifecycle one step forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceFulfillment {
    pub site_id: SiteId,
    pub sale_id: SaleId,
    pub to: FulfillmentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleCommand {
    CreateSale(CreateSale),
    AdvanceFulfillment(AdvanceFulfillment),
}

impl Command for SaleCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            SaleCommand::CreateSale(c) => c.sale_id.0,
            SaleCommand::AdvanceFulfillment(c) => c.sale_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleEvent {
    Created {
        site_id: SiteId,
        sale_id: SaleId,
        receipt_number: String,
        lines: Vec<SaleLine>,
        occurred_at: DateTime<Utc>,
    },
    FulfillmentAdvanced {
        site_id: SiteId,
        sale_id: SaleId,
        to: FulfillmentStatus,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for SaleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SaleEvent::Created { .. } => "sales.sale.created",
            SaleEvent::FulfillmentAdvanced { .. } => "sales.sale.fulfillment_advanced",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SaleEvent::Created { occurred_at, .. }
            | SaleEvent::FulfillmentAdvanced { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Sale {
    type Command = SaleCommand;
    type Event = SaleEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SaleEvent::Created {
                site_id,
                sale_id,
                receipt_number,
                lines,
                ..
            } => {
                self.id = *sale_id;
                self.site_id = Some(*site_id);
                self.receipt_number = receipt_number.clone();
                self.lines = lines.clone();
                self.fulfillment_status = FulfillmentStatus::Picking;
                self.created = true;
            }
            SaleEvent::FulfillmentAdvanced { to, .. } => {
                self.fulfillment_status = *to;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SaleCommand::CreateSale(cmd) => self.handle_create(cmd),
            SaleCommand::AdvanceFulfillment(cmd) => self.handle_advance(cmd),
        }
    }
}

impl Sale {
    fn handle_create(&self, cmd: &CreateSale) -> Result<Vec<SaleEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("sale already exists"));
        }
        if cmd.receipt_number.trim().is_empty() {
            return Err(DomainError::validation("receipt_number cannot be empty"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("sale must have at least one line"));
        }
        if cmd.lines.iter().any(|l| l.quantity <= 0) {
            return Err(DomainError::validation("line quantities must be positive"));
        }

        Ok(vec![SaleEvent::Created {
            site_id: cmd.site_id,
            sale_id: cmd.sale_id,
            receipt_number: cmd.receipt_number.clone(),
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_advance(&self, cmd: &AdvanceFulfillment) -> Result<Vec<SaleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.site_id != Some(cmd.site_id) {
            return Err(DomainError::state_conflict("site mismatch"));
        }

        if cmd.to == self.fulfillment_status {
            // Idempotent retry of an already-applied transition.
            return Ok(vec![]);
        }
        if cmd.to < self.fulfillment_status {
            return Err(DomainError::state_conflict(format!(
                "fulfillment cannot move backwards ({:?} -> {:?})",
                self.fulfillment_status, cmd.to
            )));
        }

        Ok(vec![SaleEvent::FulfillmentAdvanced {
            site_id: cmd.site_id,
            sale_id: cmd.sale_id,
            to: cmd.to,
            occurred_at: cmd.occurred_at,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_events::execute;

    fn test_site_id() -> SiteId {
        SiteId::new()
    }

    fn test_sale_id() -> SaleId {
        SaleId::new(AggregateId::new())
    }

    fn test_line(quantity: i64) -> SaleLine {
        SaleLine {
            line_no: 1,
            product_id: ProductId::new(AggregateId::new()),
            quantity,
            unit_price: 900,
        }
    }

    fn created_sale(site_id: SiteId, sale_id: SaleId) -> Sale {
        let mut sale = Sale::empty(sale_id);
        execute(
            &mut sale,
            &SaleCommand::CreateSale(CreateSale {
                site_id,
                sale_id,
                receipt_number: "RCP-0001".to_string(),
                lines: vec![test_line(5)],
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        sale
    }

    #[test]
    fn new_sale_starts_in_picking() {
        let sale = created_sale(test_site_id(), test_sale_id());
        assert_eq!(sale.fulfillment_status(), FulfillmentStatus::Picking);
    }

    #[test]
    fn create_rejects_empty_or_nonpositive_lines() {
        let sale = Sale::empty(test_sale_id());
        let err = sale
            .handle(&SaleCommand::CreateSale(CreateSale {
                site_id: test_site_id(),
                sale_id: test_sale_id(),
                receipt_number: "RCP-0002".to_string(),
                lines: vec![],
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = sale
            .handle(&SaleCommand::CreateSale(CreateSale {
                site_id: test_site_id(),
                sale_id: test_sale_id(),
                receipt_number: "RCP-0003".to_string(),
                lines: vec![test_line(0)],
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn fulfillment_advances_forward_only() {
        let mut sale = created_sale(test_site_id(), test_sale_id());
        let site_id = sale.site_id().unwrap();
        let sale_id = sale.id_typed();

        for status in [
            FulfillmentStatus::Packing,
            FulfillmentStatus::Shipped,
            FulfillmentStatus::Completed,
        ] {
            execute(
                &mut sale,
                &SaleCommand::AdvanceFulfillment(AdvanceFulfillment {
                    site_id,
                    sale_id,
                    to: status,
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap();
            assert_eq!(sale.fulfillment_status(), status);
        }

        let err = sale
            .handle(&SaleCommand::AdvanceFulfillment(AdvanceFulfillment {
                site_id,
                sale_id,
                to: FulfillmentStatus::Packing,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));
    }

    #[test]
    fn repeating_a_transition_is_a_noop() {
        let mut sale = created_sale(test_site_id(), test_sale_id());
        let site_id = sale.site_id().unwrap();
        let sale_id = sale.id_typed();
        let advance = SaleCommand::AdvanceFulfillment(AdvanceFulfillment {
            site_id,
            sale_id,
            to: FulfillmentStatus::Packing,
            occurred_at: Utc::now(),
        });

        execute(&mut sale, &advance).unwrap();
        let retry = execute(&mut sale, &advance).unwrap();
        assert!(retry.is_empty());
        assert_eq!(sale.fulfillment_status(), FulfillmentStatus::Packing);
    }
}
