//! Pharmacy dispensing workflow orchestration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use medforge_core::{AggregateId, PatientId, StaffId, TenantId};
use medforge_events::{EventBus, EventEnvelope};
use medforge_inventory::{Product, ProductId, StockMovementKind};
use medforge_pharmacy::{
    AddItem, CancelDispensing, CompleteDispensing, CreateDispensing, DispensingCommand,
    DispensingId, MarkPartial, PharmacyDispensing,
};
use medforge_sequence::{SequenceGenerator, SequenceStore, prefix};
use medforge_visits::{
    CompleteVisit, PatientVisit, PatientVisitId, VisitCommand, VisitStatus,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::services::billing_synthesis::{BillingSynthesis, SynthesisOutcome};
use crate::services::{
    DISPENSING_AGGREGATE, PRODUCT_AGGREGATE, ServiceError, VISIT_AGGREGATE, adjust_stock_command,
    merge_deltas,
};

/// Orchestrates the pharmacy dispensing workflow against the event store.
///
/// Stock is decremented optimistically when an item is created, and returned
/// by the cancellation compensating transition; each is coupled with its
/// dispensing event in one atomic unit.
pub struct PharmacyService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    sequences: Arc<SequenceGenerator<Arc<dyn SequenceStore>>>,
    billing: Arc<BillingSynthesis<S, B>>,
}

impl<S, B> PharmacyService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        sequences: Arc<SequenceGenerator<Arc<dyn SequenceStore>>>,
        billing: Arc<BillingSynthesis<S, B>>,
    ) -> Self {
        Self {
            dispatcher,
            sequences,
            billing,
        }
    }

    /// Create a dispensing transaction with a sequence-issued code.
    pub fn create_dispensing(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        visit_id: Option<PatientVisitId>,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(DispensingId, String), ServiceError> {
        let code = self
            .sequences
            .next(prefix::DISPENSING, tenant_id, now.date_naive())?;
        let dispensing_id = DispensingId::new(AggregateId::new());

        self.dispatcher.dispatch_with_retry(
            tenant_id,
            dispensing_id.0,
            DISPENSING_AGGREGATE,
            &DispensingCommand::CreateDispensing(CreateDispensing {
                tenant_id,
                dispensing_id,
                code: code.clone(),
                patient_id,
                visit_id,
                actor,
                occurred_at: now,
            }),
            |_, id| PharmacyDispensing::empty(DispensingId::new(id)),
        )?;

        tracing::info!(%tenant_id, dispensing = %code, "dispensing created");
        Ok((dispensing_id, code))
    }

    /// Add an item, decrementing the medication's stock in the same atomic
    /// unit (stock moves at item creation, not at completion). Non-stockable
    /// service products produce no movement.
    #[allow(clippy::too_many_arguments)]
    pub fn add_item(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
        medication: ProductId,
        quantity: i64,
        unit_cost: u64,
        unit_price: u64,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.run_unit(|dispatcher| {
            let product = dispatcher.load(tenant_id, medication.0, |_, id| {
                Product::empty(ProductId::new(id))
            })?;
            if product.tenant_id().is_none() {
                return Err(DispatchError::NotFound);
            }

            let (dispensing, dispensing_decision) = dispatcher.decide(
                tenant_id,
                dispensing_id.0,
                DISPENSING_AGGREGATE,
                &DispensingCommand::AddItem(AddItem {
                    tenant_id,
                    dispensing_id,
                    medication,
                    name: product.name().to_string(),
                    quantity,
                    unit_cost,
                    unit_price,
                    actor,
                    occurred_at: now,
                }),
                |_, id| PharmacyDispensing::empty(DispensingId::new(id)),
            )?;

            let mut decisions = vec![dispensing_decision];
            if product.is_stockable() {
                let (_, product_decision) = dispatcher.decide(
                    tenant_id,
                    medication.0,
                    PRODUCT_AGGREGATE,
                    &adjust_stock_command(
                        tenant_id,
                        medication,
                        -quantity,
                        StockMovementKind::Sale,
                        dispensing.code(),
                        actor,
                        now,
                    ),
                    |_, id| Product::empty(ProductId::new(id)),
                )?;
                decisions.push(product_decision);
            }

            dispatcher.commit(decisions)?;
            Ok(())
        })?;

        tracing::info!(%tenant_id, %dispensing_id, %medication, quantity, "item dispensed against stock");
        Ok(())
    }

    pub fn mark_partial(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            dispensing_id.0,
            DISPENSING_AGGREGATE,
            &DispensingCommand::MarkPartial(MarkPartial {
                tenant_id,
                dispensing_id,
                actor,
                occurred_at: now,
            }),
            |_, id| PharmacyDispensing::empty(DispensingId::new(id)),
        )?;
        Ok(())
    }

    /// Complete the dispensing; a linked visit currently `at_pharmacy`
    /// advances to `completed` in the same atomic unit. Billing synthesis
    /// runs after the commit.
    ///
    /// A `ServiceError::Synthesis` return means the dispensing (and any visit
    /// advance) is already committed and only the billing step failed.
    pub fn complete_dispensing(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<SynthesisOutcome, ServiceError> {
        self.dispatcher.run_unit(|dispatcher| {
            let (dispensing, dispensing_decision) = dispatcher.decide(
                tenant_id,
                dispensing_id.0,
                DISPENSING_AGGREGATE,
                &DispensingCommand::CompleteDispensing(CompleteDispensing {
                    tenant_id,
                    dispensing_id,
                    actor,
                    occurred_at: now,
                }),
                |_, id| PharmacyDispensing::empty(DispensingId::new(id)),
            )?;

            let mut decisions = vec![dispensing_decision];
            if let Some(visit_id) = dispensing.visit_id() {
                let visit = dispatcher.load(tenant_id, visit_id.0, |_, id| {
                    PatientVisit::empty(PatientVisitId::new(id))
                })?;
                if visit.status() == VisitStatus::AtPharmacy {
                    let (_, visit_decision) = dispatcher.decide(
                        tenant_id,
                        visit_id.0,
                        VISIT_AGGREGATE,
                        &VisitCommand::CompleteVisit(CompleteVisit {
                            tenant_id,
                            visit_id,
                            actor,
                            occurred_at: now,
                        }),
                        |_, id| PatientVisit::empty(PatientVisitId::new(id)),
                    )?;
                    decisions.push(visit_decision);
                }
            }

            dispatcher.commit(decisions)?;
            Ok(())
        })?;

        tracing::info!(%tenant_id, %dispensing_id, "dispensing completed");
        let outcome = self
            .billing
            .synthesize_dispensing(tenant_id, dispensing_id, now)?;
        Ok(outcome)
    }

    /// Cancel the dispensing and return every item's stock with `return`
    /// movements, as one atomic unit.
    pub fn cancel_dispensing(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
        reason: Option<String>,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let returned = self.dispatcher.run_unit(|dispatcher| {
            let (dispensing, dispensing_decision) = dispatcher.decide(
                tenant_id,
                dispensing_id.0,
                DISPENSING_AGGREGATE,
                &DispensingCommand::CancelDispensing(CancelDispensing {
                    tenant_id,
                    dispensing_id,
                    reason: reason.clone(),
                    actor,
                    occurred_at: now,
                }),
                |_, id| PharmacyDispensing::empty(DispensingId::new(id)),
            )?;

            let deltas = merge_deltas(dispensing.reversal_deltas());
            let mut decisions = vec![dispensing_decision];
            let mut returned = 0usize;
            for (product_id, delta) in &deltas {
                // Service products never moved stock at item creation, so
                // there is nothing to return for them.
                let product = dispatcher.load(tenant_id, product_id.0, |_, id| {
                    Product::empty(ProductId::new(id))
                })?;
                if !product.is_stockable() {
                    continue;
                }

                let (_, product_decision) = dispatcher.decide(
                    tenant_id,
                    product_id.0,
                    PRODUCT_AGGREGATE,
                    &adjust_stock_command(
                        tenant_id,
                        *product_id,
                        *delta,
                        StockMovementKind::Return,
                        dispensing.code(),
                        actor,
                        now,
                    ),
                    |_, id| Product::empty(ProductId::new(id)),
                )?;
                decisions.push(product_decision);
                returned += 1;
            }

            dispatcher.commit(decisions)?;
            Ok::<_, DispatchError>(returned)
        })?;

        tracing::info!(%tenant_id, %dispensing_id, returned, "dispensing cancelled");
        Ok(())
    }
}
