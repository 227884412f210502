//! Append-only event store boundary.
//!
//! Streams are site-scoped; the multi-stream [`StreamBatch`] append is what
//! lets a job completion and its ledger entries commit together.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};
