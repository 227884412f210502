//! Inventory domain module (event-sourced).
//!
//! A product is a per-(SKU, site) catalog entry. Its event stream **is** the
//! stock ledger: every quantity change is an immutable `StockAdjusted` event
//! carrying the signed delta, a reason code, and a reference to the job,
//! purchase order, or sale that caused it. On-hand quantity is always the sum
//! of those deltas; the catalog read model is a disposable materialization.

pub mod movement;
pub mod product;

pub use movement::{MovementReason, MovementRef, StockMovement};
pub use product::{
    AdjustStock, CreateProduct, LocationChanged, Product, ProductCommand, ProductCreated,
    ProductEvent, ProductId, ProductStatus, SetLocation, StockAdjusted, LOW_STOCK_THRESHOLD,
};
