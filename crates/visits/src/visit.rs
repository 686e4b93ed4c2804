use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medforge_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, PatientId, StaffId, TenantId,
};
use medforge_events::Event;

/// Patient visit identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientVisitId(pub AggregateId);

impl PatientVisitId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PatientVisitId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Visit status lifecycle.
///
/// The status names which downstream workflow currently owns the patient;
/// the visit itself only routes and never touches the inventory ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Registered,
    WaitingConsultation,
    InConsultation,
    WaitingLab,
    InLab,
    WaitingResults,
    WaitingPharmacy,
    AtPharmacy,
    Completed,
    Cancelled,
    NoShow,
}

impl VisitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VisitStatus::Completed | VisitStatus::Cancelled | VisitStatus::NoShow
        )
    }
}

impl core::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            VisitStatus::Registered => "registered",
            VisitStatus::WaitingConsultation => "waiting_consultation",
            VisitStatus::InConsultation => "in_consultation",
            VisitStatus::WaitingLab => "waiting_lab",
            VisitStatus::InLab => "in_lab",
            VisitStatus::WaitingResults => "waiting_results",
            VisitStatus::WaitingPharmacy => "waiting_pharmacy",
            VisitStatus::AtPharmacy => "at_pharmacy",
            VisitStatus::Completed => "completed",
            VisitStatus::Cancelled => "cancelled",
            VisitStatus::NoShow => "no_show",
        };
        f.write_str(name)
    }
}

/// Aggregate root: PatientVisit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientVisit {
    id: PatientVisitId,
    tenant_id: Option<TenantId>,
    code: String,
    patient_id: Option<PatientId>,
    status: VisitStatus,
    version: u64,
    created: bool,
}

impl PatientVisit {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PatientVisitId) -> Self {
        Self {
            id,
            tenant_id: None,
            code: String::new(),
            patient_id: None,
            status: VisitStatus::Registered,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PatientVisitId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Human-readable visit code issued at registration (e.g. `VIS-20260208-0001`).
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn status(&self) -> VisitStatus {
        self.status
    }
}

impl AggregateRoot for PatientVisit {
    type Id = PatientVisitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterVisit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterVisit {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    /// Sequence-issued visit code.
    pub code: String,
    pub patient_id: PatientId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// A guarded routing step through the visit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitRoute {
    /// `registered → waiting_consultation`
    CheckIn,
    /// `waiting_consultation → in_consultation`
    StartConsultation,
    /// `in_consultation → waiting_lab`
    ToLab,
    /// `waiting_lab → in_lab`
    StartLabWork,
    /// `in_lab → waiting_results`
    AwaitResults,
    /// `in_consultation → waiting_pharmacy`
    ToPharmacy,
    /// `waiting_pharmacy → at_pharmacy`
    ArriveAtPharmacy,
}

impl VisitRoute {
    /// The status this route departs from.
    pub fn from_status(self) -> VisitStatus {
        match self {
            VisitRoute::CheckIn => VisitStatus::Registered,
            VisitRoute::StartConsultation => VisitStatus::WaitingConsultation,
            VisitRoute::ToLab => VisitStatus::InConsultation,
            VisitRoute::StartLabWork => VisitStatus::WaitingLab,
            VisitRoute::AwaitResults => VisitStatus::InLab,
            VisitRoute::ToPharmacy => VisitStatus::InConsultation,
            VisitRoute::ArriveAtPharmacy => VisitStatus::WaitingPharmacy,
        }
    }

    /// The status this route arrives at.
    pub fn to_status(self) -> VisitStatus {
        match self {
            VisitRoute::CheckIn => VisitStatus::WaitingConsultation,
            VisitRoute::StartConsultation => VisitStatus::InConsultation,
            VisitRoute::ToLab => VisitStatus::WaitingLab,
            VisitRoute::StartLabWork => VisitStatus::InLab,
            VisitRoute::AwaitResults => VisitStatus::WaitingResults,
            VisitRoute::ToPharmacy => VisitStatus::WaitingPharmacy,
            VisitRoute::ArriveAtPharmacy => VisitStatus::AtPharmacy,
        }
    }
}

/// Command: RouteVisit (guard-and-stamp routing step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteVisit {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub route: VisitRoute,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteVisit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteVisit {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelVisit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelVisit {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub reason: Option<String>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkNoShow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkNoShow {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitCommand {
    RegisterVisit(RegisterVisit),
    RouteVisit(RouteVisit),
    CompleteVisit(CompleteVisit),
    CancelVisit(CancelVisit),
    MarkNoShow(MarkNoShow),
}

/// Event: VisitRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRegistered {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub code: String,
    pub patient_id: PatientId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VisitRouted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRouted {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub route: VisitRoute,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VisitCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCompleted {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VisitCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCancelled {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub reason: Option<String>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VisitNoShow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitNoShow {
    pub tenant_id: TenantId,
    pub visit_id: PatientVisitId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitEvent {
    VisitRegistered(VisitRegistered),
    VisitRouted(VisitRouted),
    VisitCompleted(VisitCompleted),
    VisitCancelled(VisitCancelled),
    VisitNoShow(VisitNoShow),
}

impl Event for VisitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            VisitEvent::VisitRegistered(_) => "visits.visit.registered",
            VisitEvent::VisitRouted(_) => "visits.visit.routed",
            VisitEvent::VisitCompleted(_) => "visits.visit.completed",
            VisitEvent::VisitCancelled(_) => "visits.visit.cancelled",
            VisitEvent::VisitNoShow(_) => "visits.visit.no_show",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            VisitEvent::VisitRegistered(e) => e.occurred_at,
            VisitEvent::VisitRouted(e) => e.occurred_at,
            VisitEvent::VisitCompleted(e) => e.occurred_at,
            VisitEvent::VisitCancelled(e) => e.occurred_at,
            VisitEvent::VisitNoShow(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PatientVisit {
    type Command = VisitCommand;
    type Event = VisitEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            VisitEvent::VisitRegistered(e) => {
                self.id = e.visit_id;
                self.tenant_id = Some(e.tenant_id);
                self.code = e.code.clone();
                self.patient_id = Some(e.patient_id);
                self.status = VisitStatus::Registered;
                self.created = true;
            }
            VisitEvent::VisitRouted(e) => {
                self.status = e.route.to_status();
            }
            VisitEvent::VisitCompleted(_) => {
                self.status = VisitStatus::Completed;
            }
            VisitEvent::VisitCancelled(_) => {
                self.status = VisitStatus::Cancelled;
            }
            VisitEvent::VisitNoShow(_) => {
                self.status = VisitStatus::NoShow;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            VisitCommand::RegisterVisit(cmd) => self.handle_register(cmd),
            VisitCommand::RouteVisit(cmd) => self.handle_route(cmd),
            VisitCommand::CompleteVisit(cmd) => self.handle_complete(cmd),
            VisitCommand::CancelVisit(cmd) => self.handle_cancel(cmd),
            VisitCommand::MarkNoShow(cmd) => self.handle_no_show(cmd),
        }
    }
}

impl PatientVisit {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::conflict("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_visit_id(&self, visit_id: PatientVisitId) -> Result<(), DomainError> {
        if self.id != visit_id {
            return Err(DomainError::conflict("visit_id mismatch"));
        }
        Ok(())
    }

    fn ensure_exists(&self, tenant_id: TenantId, visit_id: PatientVisitId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(tenant_id)?;
        self.ensure_visit_id(visit_id)
    }

    fn handle_register(&self, cmd: &RegisterVisit) -> Result<Vec<VisitEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("visit already exists"));
        }
        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("visit code cannot be empty"));
        }

        Ok(vec![VisitEvent::VisitRegistered(VisitRegistered {
            tenant_id: cmd.tenant_id,
            visit_id: cmd.visit_id,
            code: cmd.code.clone(),
            patient_id: cmd.patient_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_route(&self, cmd: &RouteVisit) -> Result<Vec<VisitEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.visit_id)?;

        if self.status != cmd.route.from_status() {
            return Err(DomainError::invalid_transition(format!(
                "cannot route {:?} from status {}",
                cmd.route, self.status
            )));
        }

        Ok(vec![VisitEvent::VisitRouted(VisitRouted {
            tenant_id: cmd.tenant_id,
            visit_id: cmd.visit_id,
            route: cmd.route,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteVisit) -> Result<Vec<VisitEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.visit_id)?;

        // A visit completes only once its sub-workflows have settled: directly
        // after consultation, or from the tail of the lab/pharmacy branch.
        let settled = matches!(
            self.status,
            VisitStatus::InConsultation | VisitStatus::WaitingResults | VisitStatus::AtPharmacy
        );
        if !settled {
            return Err(DomainError::invalid_transition(format!(
                "cannot complete visit from status {}",
                self.status
            )));
        }

        Ok(vec![VisitEvent::VisitCompleted(VisitCompleted {
            tenant_id: cmd.tenant_id,
            visit_id: cmd.visit_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelVisit) -> Result<Vec<VisitEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.visit_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "cannot cancel visit from terminal status {}",
                self.status
            )));
        }

        Ok(vec![VisitEvent::VisitCancelled(VisitCancelled {
            tenant_id: cmd.tenant_id,
            visit_id: cmd.visit_id,
            reason: cmd.reason.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_no_show(&self, cmd: &MarkNoShow) -> Result<Vec<VisitEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.visit_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "cannot mark no-show from terminal status {}",
                self.status
            )));
        }

        Ok(vec![VisitEvent::VisitNoShow(VisitNoShow {
            tenant_id: cmd.tenant_id,
            visit_id: cmd.visit_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
