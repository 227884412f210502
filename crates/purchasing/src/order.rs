use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{Actor, Aggregate, AggregateId, AggregateRoot, DomainError, SiteId};
use stockroom_events::{Command, Event};
use stockroom_inventory::ProductId;

/// Purchase order identifier (site-scoped via `site_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Purchase order status lifecycle.
///
/// Status is an explicit column, never inferred from the presence of
/// approval fields; "Draft because approved_by is null" is exactly the bug
/// class this enum exists to eliminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseOrderStatus {
    Draft,
    Pending,
    Approved,
    Received,
    Cancelled,
}

/// Purchase order line item.
///
/// `product_id` is optional at entry time (free-text supplier lines); it must
/// be resolved to a catalog entry before the order can be received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoLine {
    pub line_no: u32,
    pub product_id: Option<ProductId>,
    pub product_name: String,
    pub quantity: i64,
    /// Unit cost in the smallest currency unit.
    pub unit_cost: i64,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    site_id: Option<SiteId>,
    po_number: String,
    supplier_name: String,
    status: PurchaseOrderStatus,
    lines: Vec<PoLine>,
    approved_by: Option<Actor>,
    approved_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            site_id: None,
            po_number: String::new(),
            supplier_name: String::new(),
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            approved_by: None,
            approved_at: None,
            notes: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.site_id
    }

    pub fn po_number(&self) -> &str {
        &self.po_number
    }

    pub fn supplier_name(&self) -> &str {
        &self.supplier_name
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[PoLine] {
        &self.lines
    }

    pub fn approved_by(&self) -> Option<&Actor> {
        self.approved_by.as_ref()
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Lines whose `product_id` has not been resolved to a catalog entry.
    pub fn unresolved_lines(&self) -> impl Iterator<Item = &PoLine> {
        self.lines.iter().filter(|l| l.product_id.is_none())
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub po_number: String,
    pub supplier_name: String,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub product_id: Option<ProductId>,
    pub product_name: String,
    pub quantity: i64,
    pub unit_cost: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Submit (Draft → Pending; requires at least one line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submit {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Approve (Pending → Approved; records the approving actor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approve {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub approved_by: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkLineProduct — resolve a free-text line to a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLineProduct {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Receive (Approved → Received; all lines must be resolved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receive {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel (any non-Received state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReverseReceipt — administrative Received → Approved rollback.
///
/// The orchestrator pairs this with cancelling the PUTAWAY job and voiding
/// its ledger entries so stock is not double-counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseReceipt {
    pub site_id: SiteId,
    pub order_id: PurchaseOrderId,
    pub reversed_by: Actor,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    AddLine(AddLine),
    Submit(Submit),
    Approve(Approve),
    LinkLineProduct(LinkLineProduct),
    Receive(Receive),
    Cancel(Cancel),
    ReverseReceipt(ReverseReceipt),
}

impl Command for PurchaseOrderCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            PurchaseOrderCommand::CreatePurchaseOrder(c) => c.order_id.0,
            PurchaseOrderCommand::AddLine(c) => c.order_id.0,
            PurchaseOrderCommand::Submit(c) => c.order_id.0,
            PurchaseOrderCommand::Approve(c) => c.order_id.0,
            PurchaseOrderCommand::LinkLineProduct(c) => c.order_id.0,
            PurchaseOrderCommand::Receive(c) => c.order_id.0,
            PurchaseOrderCommand::Cancel(c) => c.order_id.0,
            PurchaseOrderCommand::ReverseReceipt(c) => c.order_id.0,
        }
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    Created {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        po_number: String,
        supplier_name: String,
        notes: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    LineAdded {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        line_no: u32,
        product_id: Option<ProductId>,
        product_name: String,
        quantity: i64,
        unit_cost: i64,
        occurred_at: DateTime<Utc>,
    },
    Submitted {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        occurred_at: DateTime<Utc>,
    },
    Approved {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        approved_by: Actor,
        approved_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    LineLinked {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        line_no: u32,
        product_id: ProductId,
        occurred_at: DateTime<Utc>,
    },
    Received {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    ReceiptReversed {
        site_id: SiteId,
        order_id: PurchaseOrderId,
        reversed_by: Actor,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::Created { .. } => "purchasing.po.created",
            PurchaseOrderEvent::LineAdded { .. } => "purchasing.po.line_added",
            PurchaseOrderEvent::Submitted { .. } => "purchasing.po.submitted",
            PurchaseOrderEvent::Approved { .. } => "purchasing.po.approved",
            PurchaseOrderEvent::LineLinked { .. } => "purchasing.po.line_linked",
            PurchaseOrderEvent::Received { .. } => "purchasing.po.received",
            PurchaseOrderEvent::Cancelled { .. } => "purchasing.po.cancelled",
            PurchaseOrderEvent::ReceiptReversed { .. } => "purchasing.po.receipt_reversed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::Created { occurred_at, .. }
            | PurchaseOrderEvent::LineAdded { occurred_at, .. }
            | PurchaseOrderEvent::Submitted { occurred_at, .. }
            | PurchaseOrderEvent::Approved { occurred_at, .. }
            | PurchaseOrderEvent::LineLinked { occurred_at, .. }
            | PurchaseOrderEvent::Received { occurred_at, .. }
            | PurchaseOrderEvent::Cancelled { occurred_at, .. }
            | PurchaseOrderEvent::ReceiptReversed { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::Created {
                site_id,
                order_id,
                po_number,
                supplier_name,
                notes,
                ..
            } => {
                self.id = *order_id;
                self.site_id = Some(*site_id);
                self.po_number = po_number.clone();
                self.supplier_name = supplier_name.clone();
                self.notes = notes.clone();
                self.status = PurchaseOrderStatus::Draft;
                self.lines.clear();
                self.created = true;
            }
            PurchaseOrderEvent::LineAdded {
                line_no,
                product_id,
                product_name,
                quantity,
                unit_cost,
                ..
            } => {
                self.lines.push(PoLine {
                    line_no: *line_no,
                    product_id: *product_id,
                    product_name: product_name.clone(),
                    quantity: *quantity,
                    unit_cost: *unit_cost,
                });
            }
            PurchaseOrderEvent::Submitted { .. } => {
                self.status = PurchaseOrderStatus::Pending;
            }
            PurchaseOrderEvent::Approved {
                approved_by,
                approved_at,
                ..
            } => {
                self.status = PurchaseOrderStatus::Approved;
                self.approved_by = Some(approved_by.clone());
                self.approved_at = Some(*approved_at);
            }
            PurchaseOrderEvent::LineLinked {
                line_no,
                product_id,
                ..
            } => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == *line_no) {
                    line.product_id = Some(*product_id);
                }
            }
            PurchaseOrderEvent::Received { .. } => {
                self.status = PurchaseOrderStatus::Received;
            }
            PurchaseOrderEvent::Cancelled { .. } => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
            PurchaseOrderEvent::ReceiptReversed { .. } => {
                self.status = PurchaseOrderStatus::Approved;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::Submit(cmd) => self.handle_submit(cmd),
            PurchaseOrderCommand::Approve(cmd) => self.handle_approve(cmd),
            PurchaseOrderCommand::LinkLineProduct(cmd) => self.handle_link_line(cmd),
            PurchaseOrderCommand::Receive(cmd) => self.handle_receive(cmd),
            PurchaseOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
            PurchaseOrderCommand::ReverseReceipt(cmd) => self.handle_reverse(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_site(&self, site_id: SiteId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.site_id != Some(site_id) {
            return Err(DomainError::state_conflict("site mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::state_conflict("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.po_number.trim().is_empty() {
            return Err(DomainError::validation("po_number cannot be empty"));
        }

        Ok(vec![PurchaseOrderEvent::Created {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            po_number: cmd.po_number.clone(),
            supplier_name: cmd.supplier_name.clone(),
            notes: cmd.notes.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::state_conflict(
                "cannot modify purchase order once submitted",
            ));
        }
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![PurchaseOrderEvent::LineAdded {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            line_no: next_line_no,
            product_id: cmd.product_id,
            product_name: cmd.product_name.clone(),
            quantity: cmd.quantity,
            unit_cost: cmd.unit_cost,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_submit(&self, cmd: &Submit) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::state_conflict(
                "only draft purchase orders can be submitted",
            ));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot submit purchase order without line items",
            ));
        }

        Ok(vec![PurchaseOrderEvent::Submitted {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_approve(&self, cmd: &Approve) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status == PurchaseOrderStatus::Approved {
            // Approval is an audited human action; a second approval is a
            // real conflict, not an idempotent retry.
            return Err(DomainError::state_conflict("purchase order already approved"));
        }
        if self.status != PurchaseOrderStatus::Pending {
            return Err(DomainError::state_conflict(
                "only pending purchase orders can be approved",
            ));
        }

        Ok(vec![PurchaseOrderEvent::Approved {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            approved_by: cmd.approved_by.clone(),
            approved_at: cmd.occurred_at,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_link_line(
        &self,
        cmd: &LinkLineProduct,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if matches!(
            self.status,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled
        ) {
            return Err(DomainError::state_conflict(
                "cannot relink lines on a received or cancelled purchase order",
            ));
        }

        let line = self
            .lines
            .iter()
            .find(|l| l.line_no == cmd.line_no)
            .ok_or_else(|| {
                DomainError::unresolved(format!("no line {} on this purchase order", cmd.line_no))
            })?;

        if line.product_id == Some(cmd.product_id) {
            // Idempotent retry.
            return Ok(vec![]);
        }

        Ok(vec![PurchaseOrderEvent::LineLinked {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            product_id: cmd.product_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_receive(&self, cmd: &Receive) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status == PurchaseOrderStatus::Received {
            // Receiving is the operation retried by scripts; a duplicate
            // receive is a no-op success so the orchestrator is retry-safe.
            return Ok(vec![]);
        }
        if self.status != PurchaseOrderStatus::Approved {
            return Err(DomainError::state_conflict(
                "cannot receive purchase order before approval",
            ));
        }
        if let Some(line) = self.unresolved_lines().next() {
            // A line with no resolvable product is a data error, never
            // silently dropped.
            return Err(DomainError::unresolved(format!(
                "line {} ({}) has no catalog product",
                line.line_no, line.product_name
            )));
        }

        Ok(vec![PurchaseOrderEvent::Received {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            PurchaseOrderStatus::Cancelled => Ok(vec![]),
            PurchaseOrderStatus::Received => Err(DomainError::state_conflict(
                "cannot cancel a received purchase order; reverse the receipt first",
            )),
            _ => Ok(vec![PurchaseOrderEvent::Cancelled {
                site_id: cmd.site_id,
                order_id: cmd.order_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            }]),
        }
    }

    fn handle_reverse(&self, cmd: &ReverseReceipt) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_site(cmd.site_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Received {
            return Err(DomainError::state_conflict(
                "only received purchase orders can be reversed",
            ));
        }

        Ok(vec![PurchaseOrderEvent::ReceiptReversed {
            site_id: cmd.site_id,
            order_id: cmd.order_id,
            reversed_by: cmd.reversed_by.clone(),
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

    fn test_order_id() -> PurchaseOrderId {
        PurchaseOrderId::new(AggregateId::new())
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_actor() -> Actor {
        Actor::new("warehouse.manager").unwrap()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn draft_order(site_id: SiteId, order_id: PurchaseOrderId) -> PurchaseOrder {
        let mut order = PurchaseOrder::empty(order_id);
        execute(
            &mut order,
            &PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                site_id,
                order_id,
                po_number: "PO-2024-0001".to_string(),
                supplier_name: "Acme Supply".to_string(),
                notes: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        order
    }

    fn add_line(order: &mut PurchaseOrder, product_id: Option<ProductId>, quantity: i64) {
        let site_id = order.site_id().unwrap();
        let order_id = order.id_typed();
        execute(
            order,
            &PurchaseOrderCommand::AddLine(AddLine {
                site_id,
                order_id,
                product_id,
                product_name: "Widget".to_string(),
                quantity,
                unit_cost: 500,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
    }

    fn submit_and_approve(order: &mut PurchaseOrder) {
        let site_id = order.site_id().unwrap();
        let order_id = order.id_typed();
        execute(
            order,
            &PurchaseOrderCommand::Submit(Submit {
                site_id,
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        execute(
            order,
            &PurchaseOrderCommand::Approve(Approve {
                site_id,
                order_id,
                approved_by: test_actor(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
    }

    #[test]
    fn submit_requires_at_least_one_line() {
        let order = draft_order(test_site_id(), test_order_id());
        let err = order
            .handle(&PurchaseOrderCommand::Submit(Submit {
                site_id: order.site_id().unwrap(),
                order_id: order.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn approve_records_actor_and_timestamp() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 50);
        submit_and_approve(&mut order);

        assert_eq!(order.status(), PurchaseOrderStatus::Approved);
        assert_eq!(order.approved_by(), Some(&test_actor()));
        assert!(order.approved_at().is_some());
    }

    #[test]
    fn approving_twice_is_a_state_conflict() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 50);
        submit_and_approve(&mut order);

        let err = order
            .handle(&PurchaseOrderCommand::Approve(Approve {
                site_id: order.site_id().unwrap(),
                order_id: order.id_typed(),
                approved_by: test_actor(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::StateConflict("purchase order already approved".to_string())
        );
    }

    #[test]
    fn cannot_receive_before_approval() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 50);

        let err = order
            .handle(&PurchaseOrderCommand::Receive(Receive {
                site_id: order.site_id().unwrap(),
                order_id: order.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));
    }

    #[test]
    fn receive_rejects_unresolved_lines() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, None, 50);
        submit_and_approve(&mut order);

        let err = order
            .handle(&PurchaseOrderCommand::Receive(Receive {
                site_id: order.site_id().unwrap(),
                order_id: order.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::UnresolvedReference(_)));
    }

    #[test]
    fn linking_a_line_lets_receive_proceed() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, None, 50);
        submit_and_approve(&mut order);

        let link = PurchaseOrderCommand::LinkLineProduct(LinkLineProduct {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            line_no: 1,
            product_id: test_product_id(),
            occurred_at: test_time(),
        });
        execute(&mut order, &link).unwrap();

        let receive = PurchaseOrderCommand::Receive(Receive {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });
        let events = execute(&mut order, &receive).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
    }

    #[test]
    fn duplicate_receive_is_a_noop_success() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 50);
        submit_and_approve(&mut order);

        let site_id = order.site_id().unwrap();
        let order_id = order.id_typed();
        let receive = PurchaseOrderCommand::Receive(Receive {
            site_id,
            order_id,
            occurred_at: test_time(),
        });
        execute(&mut order, &receive).unwrap();

        let retry = execute(&mut order, &receive).unwrap();
        assert!(retry.is_empty());
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
    }

    #[test]
    fn cancel_is_blocked_after_receipt() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 50);
        submit_and_approve(&mut order);
        let receive = PurchaseOrderCommand::Receive(Receive {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });
        execute(&mut order, &receive).unwrap();

        let err = order
            .handle(&PurchaseOrderCommand::Cancel(Cancel {
                site_id: order.site_id().unwrap(),
                order_id: order.id_typed(),
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));
    }

    #[test]
    fn reversal_returns_a_received_order_to_approved() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 50);
        submit_and_approve(&mut order);
        let receive = PurchaseOrderCommand::Receive(Receive {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });
        execute(&mut order, &receive).unwrap();

        let reverse = PurchaseOrderCommand::ReverseReceipt(ReverseReceipt {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            reversed_by: test_actor(),
            occurred_at: test_time(),
        });
        execute(&mut order, &reverse).unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Approved);
    }

    #[test]
    fn cancel_from_draft_and_pending_is_allowed() {
        let mut order = draft_order(test_site_id(), test_order_id());
        add_line(&mut order, Some(test_product_id()), 10);

        let cancel = PurchaseOrderCommand::Cancel(Cancel {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            reason: Some("supplier discontinued".to_string()),
            occurred_at: test_time(),
        });
        let events = execute(&mut order, &cancel).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(order.status(), PurchaseOrderStatus::Cancelled);

        // Cancelling again is an idempotent no-op.
        let cancel_again = PurchaseOrderCommand::Cancel(Cancel {
            site_id: order.site_id().unwrap(),
            order_id: order.id_typed(),
            reason: None,
            occurred_at: test_time(),
        });
        let retry = execute(&mut order, &cancel_again).unwrap();
        assert!(retry.is_empty());
    }
}
