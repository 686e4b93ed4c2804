//! Patient visit workflow orchestration.
//!
//! Thin guard-and-stamp wrappers: the visit routes the patient between
//! sub-workflows and never touches the inventory ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use medforge_core::{AggregateId, PatientId, StaffId, TenantId};
use medforge_events::{EventBus, EventEnvelope};
use medforge_sequence::{SequenceGenerator, SequenceStore, prefix};
use medforge_visits::{
    CancelVisit, CompleteVisit, MarkNoShow, PatientVisit, PatientVisitId, RegisterVisit,
    RouteVisit, VisitCommand, VisitRoute,
};

use crate::command_dispatcher::CommandDispatcher;
use crate::event_store::EventStore;
use crate::services::{ServiceError, VISIT_AGGREGATE};

/// Orchestrates the patient visit workflow against the event store.
pub struct VisitService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    sequences: Arc<SequenceGenerator<Arc<dyn SequenceStore>>>,
}

impl<S, B> VisitService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        sequences: Arc<SequenceGenerator<Arc<dyn SequenceStore>>>,
    ) -> Self {
        Self {
            dispatcher,
            sequences,
        }
    }

    /// Register a visit with a sequence-issued code.
    pub fn register_visit(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(PatientVisitId, String), ServiceError> {
        let code = self
            .sequences
            .next(prefix::VISIT, tenant_id, now.date_naive())?;
        let visit_id = PatientVisitId::new(AggregateId::new());

        self.dispatcher.dispatch_with_retry(
            tenant_id,
            visit_id.0,
            VISIT_AGGREGATE,
            &VisitCommand::RegisterVisit(RegisterVisit {
                tenant_id,
                visit_id,
                code: code.clone(),
                patient_id,
                actor,
                occurred_at: now,
            }),
            |_, id| PatientVisit::empty(PatientVisitId::new(id)),
        )?;

        tracing::info!(%tenant_id, visit = %code, "visit registered");
        Ok((visit_id, code))
    }

    /// Advance the visit along one guarded routing step.
    pub fn route(
        &self,
        tenant_id: TenantId,
        visit_id: PatientVisitId,
        route: VisitRoute,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            visit_id.0,
            VISIT_AGGREGATE,
            &VisitCommand::RouteVisit(RouteVisit {
                tenant_id,
                visit_id,
                route,
                actor,
                occurred_at: now,
            }),
            |_, id| PatientVisit::empty(PatientVisitId::new(id)),
        )?;
        Ok(())
    }

    pub fn complete_visit(
        &self,
        tenant_id: TenantId,
        visit_id: PatientVisitId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
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
        Ok(())
    }

    pub fn cancel_visit(
        &self,
        tenant_id: TenantId,
        visit_id: PatientVisitId,
        reason: Option<String>,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            visit_id.0,
            VISIT_AGGREGATE,
            &VisitCommand::CancelVisit(CancelVisit {
                tenant_id,
                visit_id,
                reason,
                actor,
                occurred_at: now,
            }),
            |_, id| PatientVisit::empty(PatientVisitId::new(id)),
        )?;
        Ok(())
    }

    pub fn mark_no_show(
        &self,
        tenant_id: TenantId,
        visit_id: PatientVisitId,
        actor: StaffId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.dispatcher.dispatch_with_retry(
            tenant_id,
            visit_id.0,
            VISIT_AGGREGATE,
            &VisitCommand::MarkNoShow(MarkNoShow {
                tenant_id,
                visit_id,
                actor,
                occurred_at: now,
            }),
            |_, id| PatientVisit::empty(PatientVisitId::new(id)),
        )?;
        Ok(())
    }
}
