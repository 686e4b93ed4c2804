use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medforge_billing::{BillingLineItem, BillingRecordId};
use medforge_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, Entity, PatientId, StaffId, TenantId,
};
use medforge_events::Event;
use medforge_inventory::ProductId;
use medforge_visits::PatientVisitId;

/// Dispensing transaction identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispensingId(pub AggregateId);

impl DispensingId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for DispensingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Dispensing status lifecycle.
///
/// Cancellation is reachable from every other status, including `dispensed`:
/// stock was decremented optimistically at item creation, so cancelling is the
/// compensating transition that returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispensingStatus {
    Pending,
    Partial,
    Dispensed,
    Cancelled,
}

impl core::fmt::Display for DispensingStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            DispensingStatus::Pending => "pending",
            DispensingStatus::Partial => "partial",
            DispensingStatus::Dispensed => "dispensed",
            DispensingStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One dispensed medication line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispensingItem {
    pub item_no: u32,
    pub medication: ProductId,
    pub name: String,
    pub quantity: i64,
    /// Cost/price in smallest currency unit (e.g., cents).
    pub unit_cost: u64,
    pub unit_price: u64,
    /// Computed `quantity × unit_price`, fixed at item creation.
    pub total_price: u64,
}

impl Entity for DispensingItem {
    type Id = u32;

    fn id(&self) -> &Self::Id {
        &self.item_no
    }
}

/// Aggregate root: PharmacyDispensing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PharmacyDispensing {
    id: DispensingId,
    tenant_id: Option<TenantId>,
    code: String,
    patient_id: Option<PatientId>,
    visit_id: Option<PatientVisitId>,
    status: DispensingStatus,
    items: Vec<DispensingItem>,
    billing_record_id: Option<BillingRecordId>,
    dispensed_by: Option<StaffId>,
    dispensed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: u64,
    created: bool,
}

impl PharmacyDispensing {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: DispensingId) -> Self {
        Self {
            id,
            tenant_id: None,
            code: String::new(),
            patient_id: None,
            visit_id: None,
            status: DispensingStatus::Pending,
            items: Vec::new(),
            billing_record_id: None,
            dispensed_by: None,
            dispensed_at: None,
            cancelled_at: None,
            cancel_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> DispensingId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Human-readable transaction code issued at creation (e.g. `DSP-20260208-0001`).
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn visit_id(&self) -> Option<PatientVisitId> {
        self.visit_id
    }

    pub fn status(&self) -> DispensingStatus {
        self.status
    }

    pub fn items(&self) -> &[DispensingItem] {
        &self.items
    }

    pub fn billing_record_id(&self) -> Option<BillingRecordId> {
        self.billing_record_id
    }

    pub fn dispensed_by(&self) -> Option<StaffId> {
        self.dispensed_by
    }

    pub fn dispensed_at(&self) -> Option<DateTime<Utc>> {
        self.dispensed_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Inverse ledger deltas for every item, applied on cancellation.
    pub fn reversal_deltas(&self) -> Vec<(ProductId, i64)> {
        self.items
            .iter()
            .map(|item| (item.medication, item.quantity))
            .collect()
    }

    /// Billable lines, 1:1 from dispensed items.
    pub fn billable_lines(&self) -> Vec<BillingLineItem> {
        self.items
            .iter()
            .map(|item| BillingLineItem {
                description: item.name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect()
    }

    /// Transaction total recomputed from line totals.
    pub fn total_amount(&self) -> Result<u64, DomainError> {
        let mut total: u64 = 0;
        for item in &self.items {
            total = total
                .checked_add(item.total_price)
                .ok_or_else(|| DomainError::validation("dispensing total overflow"))?;
        }
        Ok(total)
    }
}

impl AggregateRoot for PharmacyDispensing {
    type Id = DispensingId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateDispensing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDispensing {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    /// Sequence-issued transaction code.
    pub code: String,
    pub patient_id: PatientId,
    pub visit_id: Option<PatientVisitId>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddItem.
///
/// Stock is decremented at item creation, not at completion; the orchestrating
/// service couples the decided `ItemAdded` with the `sale` movement in one
/// atomic unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub medication: ProductId,
    pub name: String,
    pub quantity: i64,
    pub unit_cost: u64,
    pub unit_price: u64,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkPartial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPartial {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteDispensing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteDispensing {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelDispensing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDispensing {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub reason: Option<String>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkBillingRecord.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBillingRecord {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub billing_record_id: BillingRecordId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispensingCommand {
    CreateDispensing(CreateDispensing),
    AddItem(AddItem),
    MarkPartial(MarkPartial),
    CompleteDispensing(CompleteDispensing),
    CancelDispensing(CancelDispensing),
    LinkBillingRecord(LinkBillingRecord),
}

/// Event: DispensingCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispensingCreated {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub code: String,
    pub patient_id: PatientId,
    pub visit_id: Option<PatientVisitId>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub item: DispensingItem,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MarkedPartial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedPartial {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DispensingCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispensingCompleted {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DispensingCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispensingCancelled {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub reason: Option<String>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BillingRecordLinked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecordLinked {
    pub tenant_id: TenantId,
    pub dispensing_id: DispensingId,
    pub billing_record_id: BillingRecordId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispensingEvent {
    DispensingCreated(DispensingCreated),
    ItemAdded(ItemAdded),
    MarkedPartial(MarkedPartial),
    DispensingCompleted(DispensingCompleted),
    DispensingCancelled(DispensingCancelled),
    BillingRecordLinked(BillingRecordLinked),
}

impl Event for DispensingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DispensingEvent::DispensingCreated(_) => "pharmacy.dispensing.created",
            DispensingEvent::ItemAdded(_) => "pharmacy.dispensing.item_added",
            DispensingEvent::MarkedPartial(_) => "pharmacy.dispensing.marked_partial",
            DispensingEvent::DispensingCompleted(_) => "pharmacy.dispensing.completed",
            DispensingEvent::DispensingCancelled(_) => "pharmacy.dispensing.cancelled",
            DispensingEvent::BillingRecordLinked(_) => "pharmacy.dispensing.billing_record_linked",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DispensingEvent::DispensingCreated(e) => e.occurred_at,
            DispensingEvent::ItemAdded(e) => e.occurred_at,
            DispensingEvent::MarkedPartial(e) => e.occurred_at,
            DispensingEvent::DispensingCompleted(e) => e.occurred_at,
            DispensingEvent::DispensingCancelled(e) => e.occurred_at,
            DispensingEvent::BillingRecordLinked(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PharmacyDispensing {
    type Command = DispensingCommand;
    type Event = DispensingEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DispensingEvent::DispensingCreated(e) => {
                self.id = e.dispensing_id;
                self.tenant_id = Some(e.tenant_id);
                self.code = e.code.clone();
                self.patient_id = Some(e.patient_id);
                self.visit_id = e.visit_id;
                self.status = DispensingStatus::Pending;
                self.created = true;
            }
            DispensingEvent::ItemAdded(e) => {
                self.items.push(e.item.clone());
            }
            DispensingEvent::MarkedPartial(_) => {
                self.status = DispensingStatus::Partial;
            }
            DispensingEvent::DispensingCompleted(e) => {
                self.status = DispensingStatus::Dispensed;
                self.dispensed_by = Some(e.actor);
                self.dispensed_at = Some(e.occurred_at);
            }
            DispensingEvent::DispensingCancelled(e) => {
                self.status = DispensingStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
                self.cancel_reason = e.reason.clone();
            }
            DispensingEvent::BillingRecordLinked(e) => {
                self.billing_record_id = Some(e.billing_record_id);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            DispensingCommand::CreateDispensing(cmd) => self.handle_create(cmd),
            DispensingCommand::AddItem(cmd) => self.handle_add_item(cmd),
            DispensingCommand::MarkPartial(cmd) => self.handle_mark_partial(cmd),
            DispensingCommand::CompleteDispensing(cmd) => self.handle_complete(cmd),
            DispensingCommand::CancelDispensing(cmd) => self.handle_cancel(cmd),
            DispensingCommand::LinkBillingRecord(cmd) => self.handle_link_billing(cmd),
        }
    }
}

impl PharmacyDispensing {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::conflict("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_dispensing_id(&self, dispensing_id: DispensingId) -> Result<(), DomainError> {
        if self.id != dispensing_id {
            return Err(DomainError::conflict("dispensing_id mismatch"));
        }
        Ok(())
    }

    fn ensure_exists(
        &self,
        tenant_id: TenantId,
        dispensing_id: DispensingId,
    ) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(tenant_id)?;
        self.ensure_dispensing_id(dispensing_id)
    }

    fn handle_create(&self, cmd: &CreateDispensing) -> Result<Vec<DispensingEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("dispensing already exists"));
        }
        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("dispensing code cannot be empty"));
        }

        Ok(vec![DispensingEvent::DispensingCreated(DispensingCreated {
            tenant_id: cmd.tenant_id,
            dispensing_id: cmd.dispensing_id,
            code: cmd.code.clone(),
            patient_id: cmd.patient_id,
            visit_id: cmd.visit_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddItem) -> Result<Vec<DispensingEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.dispensing_id)?;

        if self.status != DispensingStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "cannot add items from status {}",
                self.status
            )));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("medication name cannot be empty"));
        }
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let total = (cmd.quantity as i128)
            .checked_mul(cmd.unit_price as i128)
            .ok_or_else(|| DomainError::validation("line total overflow"))?;
        let total_price = u64::try_from(total)
            .map_err(|_| DomainError::validation("line total out of range"))?;

        let item_no = self.items.len() as u32 + 1;
        Ok(vec![DispensingEvent::ItemAdded(ItemAdded {
            tenant_id: cmd.tenant_id,
            dispensing_id: cmd.dispensing_id,
            item: DispensingItem {
                item_no,
                medication: cmd.medication,
                name: cmd.name.clone(),
                quantity: cmd.quantity,
                unit_cost: cmd.unit_cost,
                unit_price: cmd.unit_price,
                total_price,
            },
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_partial(&self, cmd: &MarkPartial) -> Result<Vec<DispensingEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.dispensing_id)?;

        if self.status != DispensingStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "cannot mark partial from status {}",
                self.status
            )));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation(
                "cannot mark an empty dispensing partial",
            ));
        }

        Ok(vec![DispensingEvent::MarkedPartial(MarkedPartial {
            tenant_id: cmd.tenant_id,
            dispensing_id: cmd.dispensing_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteDispensing) -> Result<Vec<DispensingEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.dispensing_id)?;

        if !matches!(
            self.status,
            DispensingStatus::Pending | DispensingStatus::Partial
        ) {
            return Err(DomainError::invalid_transition(format!(
                "cannot complete dispensing from status {}",
                self.status
            )));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation(
                "cannot complete an empty dispensing",
            ));
        }

        Ok(vec![DispensingEvent::DispensingCompleted(DispensingCompleted {
            tenant_id: cmd.tenant_id,
            dispensing_id: cmd.dispensing_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelDispensing) -> Result<Vec<DispensingEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.dispensing_id)?;

        if self.status == DispensingStatus::Cancelled {
            return Err(DomainError::invalid_transition(
                "dispensing is already cancelled",
            ));
        }

        Ok(vec![DispensingEvent::DispensingCancelled(DispensingCancelled {
            tenant_id: cmd.tenant_id,
            dispensing_id: cmd.dispensing_id,
            reason: cmd.reason.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link_billing(
        &self,
        cmd: &LinkBillingRecord,
    ) -> Result<Vec<DispensingEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.dispensing_id)?;

        if self.status != DispensingStatus::Dispensed {
            return Err(DomainError::invalid_transition(format!(
                "cannot link a billing record from status {}",
                self.status
            )));
        }
        if self.billing_record_id.is_some() {
            return Err(DomainError::conflict("billing record already linked"));
        }

        Ok(vec![DispensingEvent::BillingRecordLinked(BillingRecordLinked {
            tenant_id: cmd.tenant_id,
            dispensing_id: cmd.dispensing_id,
            billing_record_id: cmd.billing_record_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
