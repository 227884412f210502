//! Disposable read-model storage.

pub mod site_store;

pub use site_store::{InMemorySiteStore, SiteStore};
