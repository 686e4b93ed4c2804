//! Laboratory workflow orchestration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use medforge_core::{AggregateId, PatientId, StaffId, TenantId};
use medforge_events::{EventBus, EventEnvelope};
use medforge_inventory::{Product, ProductId, StockMovementKind};
use medforge_laboratory::{
    CancelOrder, CollectSample, CompleteResults, CreateLabOrder, LabOrder, LabOrderCommand,
    LabOrderId, LabTest, MarkDelivered, RecordItemResult, StartProcessing, VerifyResults,
};
use medforge_sequence::{SequenceGenerator, SequenceStore, prefix};
use medforge_visits::PatientVisitId;

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::services::billing_synthesis::{BillingSynthesis, SynthesisOutcome};
use crate::services::{
    LAB_ORDER_AGGREGATE, PRODUCT_AGGREGATE, ServiceError, adjust_stock_command, merge_deltas,
};

/// Orchestrates the lab order workflow against the event store.
///
/// Transitions that consume or return stock are committed together with their
/// ledger movements in one atomic unit: the transition and every movement
/// land, or nothing does.
pub struct LaboratoryService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    sequences: Arc<SequenceGenerator<Arc<dyn SequenceStore>>>,
    billing: Arc<BillingSynthesis<S, B>>,
}

impl<S, B> LaboratoryService<S, B>
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

    /// Create a lab order with a sequence-issued code.
    pub fn create_order(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        visit_id: Option<PatientVisitId>,
        tests: Vec<LabTest>,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(LabOrderId, String), ServiceError> {
        let code = self
            .sequences
            .next(prefix::LAB_ORDER, tenant_id, now.date_naive())?;
        let order_id = LabOrderId::new(AggregateId::new());

        self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &LabOrderCommand::CreateLabOrder(CreateLabOrder {
                tenant_id,
                order_id,
                code: code.clone(),
                patient_id,
                visit_id,
                tests,
                actor,
                occurred_at: now,
            }),
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        )?;

        tracing::info!(%tenant_id, order = %code, "lab order created");
        Ok((order_id, code))
    }

    /// Collect the sample and draw down every consumable-linked item, as one
    /// atomic unit. Any failure (a guard, insufficient stock, a stale
    /// version) aborts the whole unit; the order stays `pending` and no
    /// movement lands.
    pub fn collect_sample(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let consumed = self.dispatcher.run_unit(|dispatcher| {
            let (order, order_decision) = dispatcher.decide(
                tenant_id,
                order_id.0,
                LAB_ORDER_AGGREGATE,
                &LabOrderCommand::CollectSample(CollectSample {
                    tenant_id,
                    order_id,
                    actor,
                    occurred_at: now,
                }),
                |_, id| LabOrder::empty(LabOrderId::new(id)),
            )?;

            let deltas = merge_deltas(order.consumable_deltas());
            let mut decisions = vec![order_decision];
            for (product_id, delta) in &deltas {
                let (_, product_decision) = dispatcher.decide(
                    tenant_id,
                    product_id.0,
                    PRODUCT_AGGREGATE,
                    &adjust_stock_command(
                        tenant_id,
                        *product_id,
                        *delta,
                        StockMovementKind::Sale,
                        order.code(),
                        actor,
                        now,
                    ),
                    |_, id| Product::empty(ProductId::new(id)),
                )?;
                decisions.push(product_decision);
            }

            dispatcher.commit(decisions)?;
            Ok(deltas.len())
        })?;

        tracing::info!(%tenant_id, %order_id, consumed, "sample collected");
        Ok(())
    }

    pub fn start_processing(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &LabOrderCommand::StartProcessing(StartProcessing {
                tenant_id,
                order_id,
                occurred_at: now,
            }),
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_item_result(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        item_no: u32,
        value: String,
        number: Option<f64>,
        unit: Option<String>,
        reference_range: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &LabOrderCommand::RecordItemResult(RecordItemResult {
                tenant_id,
                order_id,
                item_no,
                value,
                number,
                unit,
                reference_range,
                occurred_at: now,
            }),
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        )?;
        Ok(())
    }

    pub fn complete_results(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &LabOrderCommand::CompleteResults(CompleteResults {
                tenant_id,
                order_id,
                actor,
                occurred_at: now,
            }),
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        )?;
        Ok(())
    }

    pub fn verify_results(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &LabOrderCommand::VerifyResults(VerifyResults {
                tenant_id,
                order_id,
                actor,
                occurred_at: now,
            }),
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        )?;
        Ok(())
    }

    /// Deliver the results and synthesize the billing record.
    ///
    /// A `ServiceError::Synthesis` return means the delivery transition is
    /// already committed and only the billing step failed; the request is
    /// parked on the retry queue.
    pub fn mark_delivered(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        now: DateTime<Utc>,
    ) -> Result<SynthesisOutcome, ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &LabOrderCommand::MarkDelivered(MarkDelivered {
                tenant_id,
                order_id,
                occurred_at: now,
            }),
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        )?;

        let outcome = self.billing.synthesize_lab_order(tenant_id, order_id, now)?;
        Ok(outcome)
    }

    /// Cancel the order; if the sample was already collected, return every
    /// consumed unit with `return` movements in the same atomic unit.
    pub fn cancel_order(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        reason: Option<String>,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let returned = self.dispatcher.run_unit(|dispatcher| {
            let (order, order_decision) = dispatcher.decide(
                tenant_id,
                order_id.0,
                LAB_ORDER_AGGREGATE,
                &LabOrderCommand::CancelOrder(CancelOrder {
                    tenant_id,
                    order_id,
                    reason: reason.clone(),
                    actor,
                    occurred_at: now,
                }),
                |_, id| LabOrder::empty(LabOrderId::new(id)),
            )?;

            let deltas = if order.sample_collected() {
                merge_deltas(order.reversal_deltas())
            } else {
                Vec::new()
            };

            let mut decisions = vec![order_decision];
            for (product_id, delta) in &deltas {
                let (_, product_decision) = dispatcher.decide(
                    tenant_id,
                    product_id.0,
                    PRODUCT_AGGREGATE,
                    &adjust_stock_command(
                        tenant_id,
                        *product_id,
                        *delta,
                        StockMovementKind::Return,
                        order.code(),
                        actor,
                        now,
                    ),
                    |_, id| Product::empty(ProductId::new(id)),
                )?;
                decisions.push(product_decision);
            }

            dispatcher.commit(decisions)?;
            Ok::<_, DispatchError>(deltas.len())
        })?;

        tracing::info!(%tenant_id, %order_id, returned, "lab order cancelled");
        Ok(())
    }
}
