//! Purchasing domain module (event-sourced).
//!
//! Purchase orders move Draft → Pending → Approved → Received, with
//! Cancelled reachable from any non-Received state and an administrative
//! reversal from Received back to Approved. Receipt is what hands the order
//! to the fulfillment orchestrator for PUTAWAY job creation.

pub mod order;

pub use order::{
    AddLine, Approve, Cancel, CreatePurchaseOrder, LinkLineProduct, PoLine, PurchaseOrder,
    PurchaseOrderCommand, PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderStatus, Receive,
    ReverseReceipt, Submit,
};
