//! Ledger/catalog reconciliation.
//!
//! Recomputes every product balance from its movement history and compares
//! it against the rehydrated stock and (optionally) the catalog read model.
//! Findings are reported, never auto-corrected; a human decides whether a
//! forced adjustment is warranted.

use serde::Serialize;

use stockroom_core::Sku;
use stockroom_inventory::{Product, ProductId, StockMovement};

use crate::projections::CatalogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReconciliationFinding {
    /// Rehydrated stock disagrees with the sum of ledger deltas. This can
    /// only happen when the stream itself is damaged.
    LedgerMismatch {
        product_id: ProductId,
        sku: Sku,
        stock: i64,
        ledger_sum: i64,
    },
    /// The catalog read model drifted from the ledger and needs a rebuild.
    CatalogDrift {
        product_id: ProductId,
        sku: Sku,
        catalog_stock: i64,
        ledger_sum: i64,
    },
    /// Balance is below zero; only forced adjustments can cause this.
    NegativeBalance {
        product_id: ProductId,
        sku: Sku,
        balance: i64,
    },
    /// Movements that bypassed the non-negative guard, for audit.
    ForcedAdjustments {
        product_id: ProductId,
        sku: Sku,
        count: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub findings: Vec<ReconciliationFinding>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Check one product's rehydrated state against its movement history.
pub(crate) fn check_product(
    product: &Product,
    movements: &[StockMovement],
    findings: &mut Vec<ReconciliationFinding>,
) {
    let Some(sku) = product.sku().cloned() else {
        return;
    };
    let ledger_sum: i64 = movements.iter().map(|m| m.delta).sum();

    if product.stock() != ledger_sum {
        findings.push(ReconciliationFinding::LedgerMismatch {
            product_id: product.id_typed(),
            sku: sku.clone(),
            stock: product.stock(),
            ledger_sum,
        });
    }
    if ledger_sum < 0 {
        findings.push(ReconciliationFinding::NegativeBalance {
            product_id: product.id_typed(),
            sku: sku.clone(),
            balance: ledger_sum,
        });
    }

    let forced = movements.iter().filter(|m| m.forced).count();
    if forced > 0 {
        findings.push(ReconciliationFinding::ForcedAdjustments {
            product_id: product.id_typed(),
            sku,
            count: forced,
        });
    }
}

/// Check a catalog entry against the ledger balance for the same product.
pub fn check_catalog_entry(
    entry: &CatalogEntry,
    ledger_sum: i64,
    findings: &mut Vec<ReconciliationFinding>,
) {
    if entry.stock != ledger_sum {
        findings.push(ReconciliationFinding::CatalogDrift {
            product_id: entry.product_id,
            sku: entry.sku.clone(),
            catalog_stock: entry.stock,
            ledger_sum,
        });
    }
}
