//! Workflow orchestration services.
//!
//! Services compose pure aggregate decisions into atomic units of work and
//! call the billing synthesis step explicitly at the end of the specific
//! transition that reaches a billable state, never from a generic
//! persistence hook.

pub mod billing_synthesis;
pub mod laboratory;
pub mod pharmacy;
pub mod visits;

use chrono::{DateTime, Utc};
use thiserror::Error;

use medforge_core::{StaffId, TenantId};
use medforge_inventory::{AdjustStock, ProductCommand, ProductId, StockMovementKind};
use medforge_sequence::SequenceError;

use crate::command_dispatcher::DispatchError;
use crate::services::billing_synthesis::SynthesisError;

pub use billing_synthesis::{
    BillingConfig, BillingSynthesis, RedriveOutcome, SynthesisOutcome,
};
pub use laboratory::LaboratoryService;
pub use pharmacy::PharmacyService;
pub use visits::VisitService;

/// Stream type identifiers (stable across the store and projections).
pub const PRODUCT_AGGREGATE: &str = "inventory.product";
pub const LAB_ORDER_AGGREGATE: &str = "laboratory.order";
pub const DISPENSING_AGGREGATE: &str = "pharmacy.dispensing";
pub const VISIT_AGGREGATE: &str = "visits.visit";

/// Workflow service error.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The clinical transition committed; only the billing step failed.
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

/// Merge per-item ledger deltas so each product appears once per unit.
///
/// A unit of work appends to each stream at most once; two items drawing on
/// the same product fold into a single movement with the summed delta.
pub(crate) fn merge_deltas(deltas: Vec<(ProductId, i64)>) -> Vec<(ProductId, i64)> {
    let mut merged: Vec<(ProductId, i64)> = Vec::with_capacity(deltas.len());
    for (product_id, delta) in deltas {
        match merged.iter_mut().find(|(existing, _)| *existing == product_id) {
            Some((_, existing_delta)) => *existing_delta += delta,
            None => merged.push((product_id, delta)),
        }
    }
    merged
}

/// Build a ledger adjustment command referencing the causing transaction.
pub(crate) fn adjust_stock_command(
    tenant_id: TenantId,
    product_id: ProductId,
    delta: i64,
    kind: StockMovementKind,
    reference: &str,
    actor: StaffId,
    now: DateTime<Utc>,
) -> ProductCommand {
    ProductCommand::AdjustStock(AdjustStock {
        tenant_id,
        product_id,
        delta,
        kind,
        reference: reference.to_string(),
        actor,
        notes: None,
        occurred_at: now,
    })
}
