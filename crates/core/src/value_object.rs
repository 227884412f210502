//! Value object trait: equality by value, not identity.
//!
//! Value objects are domain objects that have **no identity** - they are
//! defined entirely by their attribute values. Two value objects with the
//! same values are considered equal.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" a
/// value object, create a new one with the new values.
///
/// - **Value Object**: no identity (`Sku("WID-001")` equals `Sku("WID-001")`)
/// - **Entity**: has identity (two products with the same fields but
///   different ids are different catalog entries)
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
