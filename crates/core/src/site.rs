//! Sites: the tenant scope for inventory.

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::SiteId;

/// Kind of location a site represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    Store,
    Warehouse,
    DistributionCenter,
    /// HQ/administrative location. Never holds inventory.
    Administrative,
}

impl SiteType {
    /// Whether catalog entries may exist at a site of this type.
    pub fn holds_inventory(self) -> bool {
        !matches!(self, SiteType::Administrative)
    }
}

/// A store, warehouse, distribution center, or administrative location.
///
/// The core treats sites as opaque tenants; this record carries only what the
/// inventory rules need (the type gate) plus a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub site_type: SiteType,
    pub name: String,
}

impl Site {
    pub fn new(id: SiteId, site_type: SiteType, name: impl Into<String>) -> Self {
        Self {
            id,
            site_type,
            name: name.into(),
        }
    }
}

impl Entity for Site {
    type Id = SiteId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn administrative_sites_never_hold_inventory() {
        assert!(!SiteType::Administrative.holds_inventory());
        assert!(SiteType::Store.holds_inventory());
        assert!(SiteType::Warehouse.holds_inventory());
        assert!(SiteType::DistributionCenter.holds_inventory());
    }
}
