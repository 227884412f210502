//! Stock movement vocabulary: reason codes and causal references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockroom_core::{AggregateId, ValueObject};

use crate::product::ProductId;

/// Why a quantity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementReason {
    /// Goods received into storage (PUTAWAY completion).
    Receive,
    /// Stock reserved/consumed by a sale.
    Sale,
    /// Stock debited at the source site of a transfer.
    TransferOut,
    /// Stock credited at the destination site of a transfer.
    TransferIn,
    /// Manual correction by reconciliation tooling. The only reason allowed
    /// to force a balance past the non-negative guard; always audit-flagged.
    Adjustment,
}

/// What caused a movement: the owning purchase order, warehouse job, or sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MovementRef {
    PurchaseOrder(AggregateId),
    Job(AggregateId),
    Sale(AggregateId),
}

impl ValueObject for MovementRef {}

/// A single ledger line, as read back from a product's stream.
///
/// Immutable once written; never updated or deleted in normal operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: Option<MovementRef>,
    /// True when an ADJUSTMENT bypassed the non-negative balance guard.
    pub forced: bool,
    pub occurred_at: DateTime<Utc>,
}

impl ValueObject for StockMovement {}
