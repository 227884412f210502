//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, recoverable business failures. Every
/// variant is something the caller (a script or API layer) can act on: retry,
/// skip, or escalate. Nothing here should ever crash the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation before any mutation (e.g. missing line items).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An illegal state transition was requested (e.g. approving an
    /// already-approved purchase order, completing a completed job).
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// A ledger delta would drive a product's running balance below zero.
    /// Never silently clamped; surfaced for manual resolution.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    /// A line item or job references a product/site that does not exist.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// An operation targeted a site type that cannot perform it
    /// (administrative sites never hold inventory).
    #[error("invalid site type: {0}")]
    InvalidSiteType(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn insufficient_stock(requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            requested,
            available,
        }
    }

    pub fn unresolved(msg: impl Into<String>) -> Self {
        Self::UnresolvedReference(msg.into())
    }

    pub fn invalid_site_type(msg: impl Into<String>) -> Self {
        Self::InvalidSiteType(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
