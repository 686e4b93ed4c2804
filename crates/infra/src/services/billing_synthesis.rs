//! Idempotent billing synthesis.
//!
//! Invoked explicitly by the laboratory/pharmacy services when an aggregate
//! reaches its billable state. The gateway is at-least-once-callable, so the
//! aggregate's linked `billing_record_id` is the idempotency marker: synthesis
//! on an already-linked aggregate is a NoOp.
//!
//! A gateway failure never rolls back the clinical transition (the service
//! already happened). The fully-materialized request is parked on the retry
//! queue for redrive instead.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use medforge_billing::{BillingGateway, BillingGatewayError, BillingRecordId, BillingRequest};
use medforge_core::{DomainError, TenantId};
use medforge_events::{EventBus, EventEnvelope};
use medforge_laboratory::{LabOrder, LabOrderCommand, LabOrderId, LabOrderStatus};
use medforge_pharmacy::{DispensingCommand, DispensingId, DispensingStatus, PharmacyDispensing};

use crate::billing_outbox::{BillingRetryQueue, OutboxError, PendingSynthesis, SynthesisSource};
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::services::{DISPENSING_AGGREGATE, LAB_ORDER_AGGREGATE};

/// Billing synthesis failure.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The source aggregate is not in its billable state.
    #[error("not billable: {0}")]
    NotBillable(String),

    /// The materialized request failed validation (deterministic).
    #[error("billing request invalid: {0}")]
    InvalidRequest(DomainError),

    /// The collaborator rejected or was unreachable; the request is parked on
    /// the retry queue.
    #[error("billing collaborator failed: {0}")]
    Gateway(BillingGatewayError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result of one synthesis invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisOutcome {
    Created(BillingRecordId),
    /// A billing record was already linked; nothing was created.
    AlreadyBilled,
}

/// Result of a redrive sweep over the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedriveOutcome {
    pub succeeded: usize,
    pub requeued: usize,
    /// Entries dropped on deterministic failures (operator attention).
    pub dropped: usize,
}

/// Billing collaborator configuration, passed explicitly at construction,
/// never as process-global state.
#[derive(Debug, Clone, Copy)]
pub struct BillingConfig {
    /// Days until the synthesized record falls due.
    pub due_in_days: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self { due_in_days: 14 }
    }
}

/// Explicit, idempotent billing synthesis step.
pub struct BillingSynthesis<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    gateway: Arc<dyn BillingGateway>,
    outbox: Arc<dyn BillingRetryQueue>,
    config: BillingConfig,
}

impl<S, B> BillingSynthesis<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        gateway: Arc<dyn BillingGateway>,
        outbox: Arc<dyn BillingRetryQueue>,
        config: BillingConfig,
    ) -> Self {
        Self {
            dispatcher,
            gateway,
            outbox,
            config,
        }
    }

    /// Synthesize a billing record for a delivered lab order.
    pub fn synthesize_lab_order(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        now: DateTime<Utc>,
    ) -> Result<SynthesisOutcome, SynthesisError> {
        self.synthesize_lab_order_inner(tenant_id, order_id, now, 1)
    }

    fn synthesize_lab_order_inner(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
        now: DateTime<Utc>,
        failure_attempts: u32,
    ) -> Result<SynthesisOutcome, SynthesisError> {
        let order = self.load_order(tenant_id, order_id)?;

        if order.billing_record_id().is_some() {
            return Ok(SynthesisOutcome::AlreadyBilled);
        }
        if order.status() != LabOrderStatus::ResultsDelivered {
            return Err(SynthesisError::NotBillable(format!(
                "lab order {} is {}",
                order.code(),
                order.status()
            )));
        }
        let payer = order
            .patient_id()
            .ok_or_else(|| SynthesisError::NotBillable("lab order has no patient".to_string()))?;

        let request = BillingRequest::new(
            tenant_id,
            payer,
            format!("Laboratory order {}", order.code()),
            now + Duration::days(self.config.due_in_days),
            order.billable_lines(),
        )
        .map_err(SynthesisError::InvalidRequest)?;

        let record_id = self.call_gateway(
            &request,
            SynthesisSource::LabOrder { order_id },
            now,
            failure_attempts,
        )?;

        let link = LabOrderCommand::LinkBillingRecord(medforge_laboratory::LinkBillingRecord {
            tenant_id,
            order_id,
            billing_record_id: record_id,
            occurred_at: now,
        });
        match self.dispatcher.dispatch_with_retry(
            tenant_id,
            order_id.0,
            LAB_ORDER_AGGREGATE,
            &link,
            |_, id| LabOrder::empty(LabOrderId::new(id)),
        ) {
            Ok(_) => {
                tracing::info!(%tenant_id, order = %order.code(), %record_id, "billing record created for lab order");
                Ok(SynthesisOutcome::Created(record_id))
            }
            Err(DispatchError::ConcurrencyConflict(_)) => {
                // A concurrent synthesis won the link; ours is an external
                // duplicate the collaborator dedup/void tooling handles.
                let reloaded = self.load_order(tenant_id, order_id)?;
                if reloaded.billing_record_id().is_some() {
                    tracing::warn!(%tenant_id, order = %order.code(), %record_id, "duplicate billing record created by concurrent synthesis");
                    Ok(SynthesisOutcome::AlreadyBilled)
                } else {
                    Err(SynthesisError::Dispatch(DispatchError::ConcurrencyConflict(
                        "billing record link lost its retry budget".to_string(),
                    )))
                }
            }
            Err(other) => Err(SynthesisError::Dispatch(other)),
        }
    }

    /// Synthesize a billing record for a completed dispensing.
    pub fn synthesize_dispensing(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
        now: DateTime<Utc>,
    ) -> Result<SynthesisOutcome, SynthesisError> {
        self.synthesize_dispensing_inner(tenant_id, dispensing_id, now, 1)
    }

    fn synthesize_dispensing_inner(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
        now: DateTime<Utc>,
        failure_attempts: u32,
    ) -> Result<SynthesisOutcome, SynthesisError> {
        let dispensing = self.load_dispensing(tenant_id, dispensing_id)?;

        if dispensing.billing_record_id().is_some() {
            return Ok(SynthesisOutcome::AlreadyBilled);
        }
        if dispensing.status() != DispensingStatus::Dispensed {
            return Err(SynthesisError::NotBillable(format!(
                "dispensing {} is {}",
                dispensing.code(),
                dispensing.status()
            )));
        }
        let payer = dispensing
            .patient_id()
            .ok_or_else(|| SynthesisError::NotBillable("dispensing has no patient".to_string()))?;

        let request = BillingRequest::new(
            tenant_id,
            payer,
            format!("Pharmacy dispensing {}", dispensing.code()),
            now + Duration::days(self.config.due_in_days),
            dispensing.billable_lines(),
        )
        .map_err(SynthesisError::InvalidRequest)?;

        let record_id = self.call_gateway(
            &request,
            SynthesisSource::Dispensing { dispensing_id },
            now,
            failure_attempts,
        )?;

        let link = DispensingCommand::LinkBillingRecord(medforge_pharmacy::LinkBillingRecord {
            tenant_id,
            dispensing_id,
            billing_record_id: record_id,
            occurred_at: now,
        });
        match self.dispatcher.dispatch_with_retry(
            tenant_id,
            dispensing_id.0,
            DISPENSING_AGGREGATE,
            &link,
            |_, id| PharmacyDispensing::empty(DispensingId::new(id)),
        ) {
            Ok(_) => {
                tracing::info!(%tenant_id, dispensing = %dispensing.code(), %record_id, "billing record created for dispensing");
                Ok(SynthesisOutcome::Created(record_id))
            }
            Err(DispatchError::ConcurrencyConflict(_)) => {
                let reloaded = self.load_dispensing(tenant_id, dispensing_id)?;
                if reloaded.billing_record_id().is_some() {
                    tracing::warn!(%tenant_id, dispensing = %dispensing.code(), %record_id, "duplicate billing record created by concurrent synthesis");
                    Ok(SynthesisOutcome::AlreadyBilled)
                } else {
                    Err(SynthesisError::Dispatch(DispatchError::ConcurrencyConflict(
                        "billing record link lost its retry budget".to_string(),
                    )))
                }
            }
            Err(other) => Err(SynthesisError::Dispatch(other)),
        }
    }

    /// Re-drive parked requests once (e.g. from a periodic worker or operator
    /// action). Each claimed entry is re-synthesized from its source aggregate
    /// so the idempotency check still applies; fresh gateway failures re-park
    /// the entry with an incremented attempt count.
    pub fn redrive(&self, now: DateTime<Utc>) -> Result<RedriveOutcome, SynthesisError> {
        let mut outcome = RedriveOutcome::default();

        // Snapshot the queue length so entries re-parked by this sweep are not
        // claimed again within it.
        let parked = self.outbox.len();
        for _ in 0..parked {
            let Some(entry) = self.outbox.claim_next()? else {
                break;
            };

            let result = match entry.source {
                SynthesisSource::LabOrder { order_id } => self.synthesize_lab_order_inner(
                    entry.tenant_id,
                    order_id,
                    now,
                    entry.attempts + 1,
                ),
                SynthesisSource::Dispensing { dispensing_id } => self
                    .synthesize_dispensing_inner(
                        entry.tenant_id,
                        dispensing_id,
                        now,
                        entry.attempts + 1,
                    ),
            };

            match result {
                Ok(_) => outcome.succeeded += 1,
                Err(SynthesisError::Gateway(_)) => outcome.requeued += 1,
                Err(err) => {
                    // Deterministic failure: dropping beats an endless loop,
                    // but it needs eyes.
                    tracing::error!(tenant_id = %entry.tenant_id, ?entry.source, %err, "dropping unredrivable billing request");
                    outcome.dropped += 1;
                }
            }
        }

        Ok(outcome)
    }

    fn call_gateway(
        &self,
        request: &BillingRequest,
        source: SynthesisSource,
        now: DateTime<Utc>,
        attempts: u32,
    ) -> Result<BillingRecordId, SynthesisError> {
        match self.gateway.create_record(request) {
            Ok(record_id) => Ok(record_id),
            Err(err) => {
                self.outbox.enqueue(PendingSynthesis {
                    tenant_id: request.tenant_id,
                    source,
                    request: request.clone(),
                    attempts,
                    last_error: err.to_string(),
                    failed_at: now,
                })?;
                tracing::warn!(tenant_id = %request.tenant_id, ?source, %err, "billing synthesis failed; request parked for redrive");
                Err(SynthesisError::Gateway(err))
            }
        }
    }

    fn load_order(
        &self,
        tenant_id: TenantId,
        order_id: LabOrderId,
    ) -> Result<LabOrder, SynthesisError> {
        Ok(self
            .dispatcher
            .load(tenant_id, order_id.0, |_, id| {
                LabOrder::empty(LabOrderId::new(id))
            })?)
    }

    fn load_dispensing(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
    ) -> Result<PharmacyDispensing, SynthesisError> {
        Ok(self
            .dispatcher
            .load(tenant_id, dispensing_id.0, |_, id| {
                PharmacyDispensing::empty(DispensingId::new(id))
            })?)
    }
}
