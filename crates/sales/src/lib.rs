//! Sales domain module (event-sourced).
//!
//! Sales themselves are created by POS/procurement flows outside this core;
//! what lives here is the fulfillment lifecycle the warehouse drives:
//! Picking → Packing → Shipped → Completed, advanced by the orchestrator as
//! PICK/PACK/DISPATCH jobs complete.

pub mod sale;

pub use sale::{
    AdvanceFulfillment, CreateSale, FulfillmentStatus, Sale, SaleCommand, SaleEvent, SaleId,
    SaleLine,
};
