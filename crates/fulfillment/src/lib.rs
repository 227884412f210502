//! Fulfillment orchestration and infrastructure.
//!
//! This crate wires the domain crates together: the append-only event
//! store, the command dispatcher, the disposable read models, and the
//! [`FulfillmentService`] that runs the cross-aggregate flows (receive a
//! purchase order → putaway, sell → pick → pack → dispatch, transfer
//! between sites).
//!
//! Domain crates stay pure; everything with a lock, a pool, or a side
//! effect lives here.

pub mod command_dispatcher;
pub mod event_store;
pub mod numbering;
pub mod projections;
pub mod read_model;
pub mod reconcile;
pub mod service;

pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, StoredEvent, StreamBatch, UncommittedEvent,
};
#[cfg(feature = "postgres")]
pub use event_store::postgres::PostgresEventStore;
pub use numbering::NumberAllocator;
pub use read_model::{InMemorySiteStore, SiteStore};
pub use reconcile::{ReconciliationFinding, ReconciliationReport};
pub use service::{BrokenJobLine, FulfillmentError, FulfillmentService, NewSaleLine, TransferLine};
