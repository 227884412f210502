//! `stockroom-events` — event mechanics shared across domain modules.
//!
//! Events here are **facts**: immutable, versioned, append-only. This crate
//! carries no business rules; it provides the contracts domain crates and
//! infrastructure agree on (events, envelopes, buses).

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
