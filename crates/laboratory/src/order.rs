use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medforge_billing::{BillingLineItem, BillingRecordId};
use medforge_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, Entity, PatientId, StaffId, TenantId,
};
use medforge_events::Event;
use medforge_inventory::ProductId;
use medforge_visits::PatientVisitId;

use crate::catalog::LabTest;
use crate::results::{AbnormalFlag, classify};

/// Lab order identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabOrderId(pub AggregateId);

impl LabOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for LabOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lab order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabOrderStatus {
    Pending,
    SampleCollected,
    InProgress,
    Completed,
    ResultsReady,
    ResultsDelivered,
    Cancelled,
}

impl LabOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LabOrderStatus::ResultsDelivered | LabOrderStatus::Cancelled
        )
    }
}

impl core::fmt::Display for LabOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            LabOrderStatus::Pending => "pending",
            LabOrderStatus::SampleCollected => "sample_collected",
            LabOrderStatus::InProgress => "in_progress",
            LabOrderStatus::Completed => "completed",
            LabOrderStatus::ResultsReady => "results_ready",
            LabOrderStatus::ResultsDelivered => "results_delivered",
            LabOrderStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Recorded result fields for one ordered test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub value: String,
    pub number: Option<f64>,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
    /// Derived from `number` against the parsed range; `None` when either is
    /// missing or the range is unparsable.
    pub abnormal_flag: Option<AbnormalFlag>,
}

/// One ordered test within a lab order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabOrderItem {
    pub item_no: u32,
    pub test: LabTest,
    pub result: Option<ItemResult>,
}

impl Entity for LabOrderItem {
    type Id = u32;

    fn id(&self) -> &Self::Id {
        &self.item_no
    }
}

/// Aggregate root: LabOrder.
///
/// Owns the ordered items; mutated only through its own transition commands
/// and immutable once terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct LabOrder {
    id: LabOrderId,
    tenant_id: Option<TenantId>,
    code: String,
    patient_id: Option<PatientId>,
    visit_id: Option<PatientVisitId>,
    status: LabOrderStatus,
    items: Vec<LabOrderItem>,
    /// Set once the sample has been taken; survives cancellation so the
    /// cancelling unit knows whether consumption must be reversed.
    sample_collected: bool,
    billing_record_id: Option<BillingRecordId>,
    collected_by: Option<StaffId>,
    collected_at: Option<DateTime<Utc>>,
    completed_by: Option<StaffId>,
    completed_at: Option<DateTime<Utc>>,
    verified_by: Option<StaffId>,
    verified_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    version: u64,
    created: bool,
}

impl LabOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: LabOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            code: String::new(),
            patient_id: None,
            visit_id: None,
            status: LabOrderStatus::Pending,
            items: Vec::new(),
            sample_collected: false,
            billing_record_id: None,
            collected_by: None,
            collected_at: None,
            completed_by: None,
            completed_at: None,
            verified_by: None,
            verified_at: None,
            delivered_at: None,
            cancelled_at: None,
            cancel_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> LabOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Human-readable order code issued at creation (e.g. `LAB-20260208-0001`).
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn visit_id(&self) -> Option<PatientVisitId> {
        self.visit_id
    }

    pub fn status(&self) -> LabOrderStatus {
        self.status
    }

    pub fn items(&self) -> &[LabOrderItem] {
        &self.items
    }

    pub fn sample_collected(&self) -> bool {
        self.sample_collected
    }

    pub fn billing_record_id(&self) -> Option<BillingRecordId> {
        self.billing_record_id
    }

    pub fn collected_by(&self) -> Option<StaffId> {
        self.collected_by
    }

    pub fn collected_at(&self) -> Option<DateTime<Utc>> {
        self.collected_at
    }

    pub fn completed_by(&self) -> Option<StaffId> {
        self.completed_by
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn verified_by(&self) -> Option<StaffId> {
        self.verified_by
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Ledger decrements due at sample collection: −1 per consumable-linked item.
    pub fn consumable_deltas(&self) -> Vec<(ProductId, i64)> {
        self.items
            .iter()
            .filter_map(|item| item.test.consumable.map(|product_id| (product_id, -1)))
            .collect()
    }

    /// Inverse of `consumable_deltas`, applied when a collected order is cancelled.
    pub fn reversal_deltas(&self) -> Vec<(ProductId, i64)> {
        self.consumable_deltas()
            .into_iter()
            .map(|(product_id, delta)| (product_id, -delta))
            .collect()
    }

    /// Billable lines, 1:1 from ordered items.
    pub fn billable_lines(&self) -> Vec<BillingLineItem> {
        self.items
            .iter()
            .map(|item| BillingLineItem {
                description: item.test.name.clone(),
                quantity: 1,
                unit_price: item.test.price,
            })
            .collect()
    }
}

impl AggregateRoot for LabOrder {
    type Id = LabOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateLabOrder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateLabOrder {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    /// Sequence-issued order code.
    pub code: String,
    pub patient_id: PatientId,
    pub visit_id: Option<PatientVisitId>,
    pub tests: Vec<LabTest>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CollectSample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectSample {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartProcessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartProcessing {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordItemResult.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordItemResult {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub item_no: u32,
    pub value: String,
    pub number: Option<f64>,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteResults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResults {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: VerifyResults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResults {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkDelivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkDelivered {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub reason: Option<String>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkBillingRecord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBillingRecord {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub billing_record_id: BillingRecordId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabOrderCommand {
    CreateLabOrder(CreateLabOrder),
    CollectSample(CollectSample),
    StartProcessing(StartProcessing),
    RecordItemResult(RecordItemResult),
    CompleteResults(CompleteResults),
    VerifyResults(VerifyResults),
    MarkDelivered(MarkDelivered),
    CancelOrder(CancelOrder),
    LinkBillingRecord(LinkBillingRecord),
}

/// Event: LabOrderCreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabOrderCreated {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub code: String,
    pub patient_id: PatientId,
    pub visit_id: Option<PatientVisitId>,
    pub tests: Vec<LabTest>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SampleCollected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCollected {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProcessingStarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStarted {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemResultRecorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResultRecorded {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub item_no: u32,
    pub result: ItemResult,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ResultsCompleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsCompleted {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ResultsVerified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsVerified {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ResultsDelivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsDelivered {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LabOrderCancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabOrderCancelled {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub reason: Option<String>,
    pub actor: StaffId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BillingRecordLinked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecordLinked {
    pub tenant_id: TenantId,
    pub order_id: LabOrderId,
    pub billing_record_id: BillingRecordId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabOrderEvent {
    LabOrderCreated(LabOrderCreated),
    SampleCollected(SampleCollected),
    ProcessingStarted(ProcessingStarted),
    ItemResultRecorded(ItemResultRecorded),
    ResultsCompleted(ResultsCompleted),
    ResultsVerified(ResultsVerified),
    ResultsDelivered(ResultsDelivered),
    LabOrderCancelled(LabOrderCancelled),
    BillingRecordLinked(BillingRecordLinked),
}

impl Event for LabOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LabOrderEvent::LabOrderCreated(_) => "laboratory.order.created",
            LabOrderEvent::SampleCollected(_) => "laboratory.order.sample_collected",
            LabOrderEvent::ProcessingStarted(_) => "laboratory.order.processing_started",
            LabOrderEvent::ItemResultRecorded(_) => "laboratory.order.item_result_recorded",
            LabOrderEvent::ResultsCompleted(_) => "laboratory.order.results_completed",
            LabOrderEvent::ResultsVerified(_) => "laboratory.order.results_verified",
            LabOrderEvent::ResultsDelivered(_) => "laboratory.order.results_delivered",
            LabOrderEvent::LabOrderCancelled(_) => "laboratory.order.cancelled",
            LabOrderEvent::BillingRecordLinked(_) => "laboratory.order.billing_record_linked",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LabOrderEvent::LabOrderCreated(e) => e.occurred_at,
            LabOrderEvent::SampleCollected(e) => e.occurred_at,
            LabOrderEvent::ProcessingStarted(e) => e.occurred_at,
            LabOrderEvent::ItemResultRecorded(e) => e.occurred_at,
            LabOrderEvent::ResultsCompleted(e) => e.occurred_at,
            LabOrderEvent::ResultsVerified(e) => e.occurred_at,
            LabOrderEvent::ResultsDelivered(e) => e.occurred_at,
            LabOrderEvent::LabOrderCancelled(e) => e.occurred_at,
            LabOrderEvent::BillingRecordLinked(e) => e.occurred_at,
        }
    }
}

impl Aggregate for LabOrder {
    type Command = LabOrderCommand;
    type Event = LabOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LabOrderEvent::LabOrderCreated(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.code = e.code.clone();
                self.patient_id = Some(e.patient_id);
                self.visit_id = e.visit_id;
                self.status = LabOrderStatus::Pending;
                self.items = e
                    .tests
                    .iter()
                    .enumerate()
                    .map(|(idx, test)| LabOrderItem {
                        item_no: idx as u32 + 1,
                        test: test.clone(),
                        result: None,
                    })
                    .collect();
                self.created = true;
            }
            LabOrderEvent::SampleCollected(e) => {
                self.status = LabOrderStatus::SampleCollected;
                self.sample_collected = true;
                self.collected_by = Some(e.actor);
                self.collected_at = Some(e.occurred_at);
            }
            LabOrderEvent::ProcessingStarted(_) => {
                self.status = LabOrderStatus::InProgress;
            }
            LabOrderEvent::ItemResultRecorded(e) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.item_no == e.item_no) {
                    item.result = Some(e.result.clone());
                }
            }
            LabOrderEvent::ResultsCompleted(e) => {
                self.status = LabOrderStatus::Completed;
                self.completed_by = Some(e.actor);
                self.completed_at = Some(e.occurred_at);
            }
            LabOrderEvent::ResultsVerified(e) => {
                self.status = LabOrderStatus::ResultsReady;
                self.verified_by = Some(e.actor);
                self.verified_at = Some(e.occurred_at);
            }
            LabOrderEvent::ResultsDelivered(e) => {
                self.status = LabOrderStatus::ResultsDelivered;
                self.delivered_at = Some(e.occurred_at);
            }
            LabOrderEvent::LabOrderCancelled(e) => {
                self.status = LabOrderStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
                self.cancel_reason = e.reason.clone();
            }
            LabOrderEvent::BillingRecordLinked(e) => {
                self.billing_record_id = Some(e.billing_record_id);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LabOrderCommand::CreateLabOrder(cmd) => self.handle_create(cmd),
            LabOrderCommand::CollectSample(cmd) => self.handle_collect_sample(cmd),
            LabOrderCommand::StartProcessing(cmd) => self.handle_start_processing(cmd),
            LabOrderCommand::RecordItemResult(cmd) => self.handle_record_result(cmd),
            LabOrderCommand::CompleteResults(cmd) => self.handle_complete_results(cmd),
            LabOrderCommand::VerifyResults(cmd) => self.handle_verify_results(cmd),
            LabOrderCommand::MarkDelivered(cmd) => self.handle_mark_delivered(cmd),
            LabOrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
            LabOrderCommand::LinkBillingRecord(cmd) => self.handle_link_billing(cmd),
        }
    }
}

impl LabOrder {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::conflict("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: LabOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::conflict("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_exists(&self, tenant_id: TenantId, order_id: LabOrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(tenant_id)?;
        self.ensure_order_id(order_id)
    }

    fn ensure_status(&self, expected: LabOrderStatus, action: &str) -> Result<(), DomainError> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} from status {}",
                self.status
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateLabOrder) -> Result<Vec<LabOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("lab order already exists"));
        }
        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("order code cannot be empty"));
        }
        if cmd.tests.is_empty() {
            return Err(DomainError::validation(
                "cannot create a lab order without tests",
            ));
        }

        Ok(vec![LabOrderEvent::LabOrderCreated(LabOrderCreated {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            code: cmd.code.clone(),
            patient_id: cmd.patient_id,
            visit_id: cmd.visit_id,
            tests: cmd.tests.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_collect_sample(&self, cmd: &CollectSample) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::Pending, "collect sample")?;

        Ok(vec![LabOrderEvent::SampleCollected(SampleCollected {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start_processing(
        &self,
        cmd: &StartProcessing,
    ) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::SampleCollected, "start processing")?;

        Ok(vec![LabOrderEvent::ProcessingStarted(ProcessingStarted {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_result(
        &self,
        cmd: &RecordItemResult,
    ) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::InProgress, "record a result")?;

        if !self.items.iter().any(|item| item.item_no == cmd.item_no) {
            return Err(DomainError::not_found());
        }
        if cmd.value.trim().is_empty() {
            return Err(DomainError::validation("result value cannot be empty"));
        }

        // Best-effort classification: missing number or unparsable range
        // leaves the item unclassified rather than erroring.
        let abnormal_flag = match (cmd.number, cmd.reference_range.as_deref()) {
            (Some(number), Some(range)) => classify(number, range),
            _ => None,
        };

        Ok(vec![LabOrderEvent::ItemResultRecorded(ItemResultRecorded {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            item_no: cmd.item_no,
            result: ItemResult {
                value: cmd.value.clone(),
                number: cmd.number,
                unit: cmd.unit.clone(),
                reference_range: cmd.reference_range.clone(),
                abnormal_flag,
            },
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete_results(
        &self,
        cmd: &CompleteResults,
    ) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::InProgress, "complete results")?;

        let missing = self.items.iter().filter(|i| i.result.is_none()).count();
        if missing > 0 {
            return Err(DomainError::validation(format!(
                "cannot complete results while {missing} item(s) lack a result"
            )));
        }

        Ok(vec![LabOrderEvent::ResultsCompleted(ResultsCompleted {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_verify_results(&self, cmd: &VerifyResults) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::Completed, "verify results")?;

        Ok(vec![LabOrderEvent::ResultsVerified(ResultsVerified {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_delivered(&self, cmd: &MarkDelivered) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::ResultsReady, "mark delivered")?;

        Ok(vec![LabOrderEvent::ResultsDelivered(ResultsDelivered {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "cannot cancel order from terminal status {}",
                self.status
            )));
        }

        Ok(vec![LabOrderEvent::LabOrderCancelled(LabOrderCancelled {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            reason: cmd.reason.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link_billing(
        &self,
        cmd: &LinkBillingRecord,
    ) -> Result<Vec<LabOrderEvent>, DomainError> {
        self.ensure_exists(cmd.tenant_id, cmd.order_id)?;
        self.ensure_status(LabOrderStatus::ResultsDelivered, "link a billing record")?;

        if self.billing_record_id.is_some() {
            return Err(DomainError::conflict("billing record already linked"));
        }

        Ok(vec![LabOrderEvent::BillingRecordLinked(BillingRecordLinked {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            billing_record_id: cmd.billing_record_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medforge_core::AggregateId;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_order_id() -> LabOrderId {
        LabOrderId::new(AggregateId::new())
    }

    fn test_actor() -> StaffId {
        StaffId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn cbc(consumable: Option<ProductId>) -> LabTest {
        LabTest::new("CBC", "Complete Blood Count", 1500, consumable).unwrap()
    }

    fn glucose() -> LabTest {
        LabTest::new("GLU", "Fasting Glucose", 800, None).unwrap()
    }

    fn created_order(tenant_id: TenantId, order_id: LabOrderId, tests: Vec<LabTest>) -> LabOrder {
        let mut order = LabOrder::empty(order_id);
        let events = order
            .handle(&LabOrderCommand::CreateLabOrder(CreateLabOrder {
                tenant_id,
                order_id,
                code: "LAB-20260208-0001".to_string(),
                patient_id: PatientId::new(),
                visit_id: None,
                tests,
                actor: test_actor(),
                occurred_at: test_time(),
            }))
            .unwrap();
        order.apply(&events[0]);
        order
    }

    fn step(order: &mut LabOrder, cmd: LabOrderCommand) {
        let events = order.handle(&cmd).unwrap();
        for event in &events {
            order.apply(event);
        }
    }

    fn record_all_results(order: &mut LabOrder) {
        let item_nos: Vec<u32> = order.items().iter().map(|i| i.item_no).collect();
        for item_no in item_nos {
            step(
                order,
                LabOrderCommand::RecordItemResult(RecordItemResult {
                    tenant_id: order.tenant_id().unwrap(),
                    order_id: order.id_typed(),
                    item_no,
                    value: "7.2".to_string(),
                    number: Some(7.2),
                    unit: Some("10^9/L".to_string()),
                    reference_range: Some("4.0-11.0".to_string()),
                    occurred_at: test_time(),
                }),
            );
        }
    }

    #[test]
    fn creation_numbers_items_from_one() {
        let order = created_order(
            test_tenant_id(),
            test_order_id(),
            vec![cbc(None), glucose()],
        );
        assert_eq!(order.status(), LabOrderStatus::Pending);
        let numbers: Vec<u32> = order.items().iter().map(|i| i.item_no).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn creation_requires_tests() {
        let order = LabOrder::empty(test_order_id());
        let err = order
            .handle(&LabOrderCommand::CreateLabOrder(CreateLabOrder {
                tenant_id: test_tenant_id(),
                order_id: test_order_id(),
                code: "LAB-20260208-0002".to_string(),
                patient_id: PatientId::new(),
                visit_id: None,
                tests: vec![],
                actor: test_actor(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn full_lifecycle_reaches_results_delivered() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        let actor = test_actor();

        step(
            &mut order,
            LabOrderCommand::CollectSample(CollectSample {
                tenant_id,
                order_id,
                actor,
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.status(), LabOrderStatus::SampleCollected);
        assert_eq!(order.collected_by(), Some(actor));
        assert!(order.collected_at().is_some());

        step(
            &mut order,
            LabOrderCommand::StartProcessing(StartProcessing {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.status(), LabOrderStatus::InProgress);

        record_all_results(&mut order);

        step(
            &mut order,
            LabOrderCommand::CompleteResults(CompleteResults {
                tenant_id,
                order_id,
                actor,
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.status(), LabOrderStatus::Completed);

        step(
            &mut order,
            LabOrderCommand::VerifyResults(VerifyResults {
                tenant_id,
                order_id,
                actor,
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.status(), LabOrderStatus::ResultsReady);
        assert_eq!(order.verified_by(), Some(actor));

        step(
            &mut order,
            LabOrderCommand::MarkDelivered(MarkDelivered {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.status(), LabOrderStatus::ResultsDelivered);
        assert!(order.status().is_terminal());
    }

    #[test]
    fn pending_order_cannot_jump_to_results_ready() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let order = created_order(tenant_id, order_id, vec![cbc(None)]);

        let err = order
            .handle(&LabOrderCommand::VerifyResults(VerifyResults {
                tenant_id,
                order_id,
                actor: test_actor(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(order.status(), LabOrderStatus::Pending);
    }

    #[test]
    fn collect_sample_valid_only_from_pending() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        let collect = LabOrderCommand::CollectSample(CollectSample {
            tenant_id,
            order_id,
            actor: test_actor(),
            occurred_at: test_time(),
        });

        step(&mut order, collect.clone());
        let err = order.handle(&collect).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn consumable_deltas_cover_linked_items_only() {
        let product_a = test_product_id();
        let product_b = test_product_id();
        let order = created_order(
            test_tenant_id(),
            test_order_id(),
            vec![cbc(Some(product_a)), glucose(), cbc(Some(product_b))],
        );

        let deltas = order.consumable_deltas();
        assert_eq!(deltas, vec![(product_a, -1), (product_b, -1)]);
        assert_eq!(
            order.reversal_deltas(),
            vec![(product_a, 1), (product_b, 1)]
        );
    }

    #[test]
    fn recorded_result_is_classified_against_range() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        step(
            &mut order,
            LabOrderCommand::CollectSample(CollectSample {
                tenant_id,
                order_id,
                actor: test_actor(),
                occurred_at: test_time(),
            }),
        );
        step(
            &mut order,
            LabOrderCommand::StartProcessing(StartProcessing {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );

        step(
            &mut order,
            LabOrderCommand::RecordItemResult(RecordItemResult {
                tenant_id,
                order_id,
                item_no: 1,
                value: "13.5".to_string(),
                number: Some(13.5),
                unit: Some("10^9/L".to_string()),
                reference_range: Some("4.0-11.0".to_string()),
                occurred_at: test_time(),
            }),
        );

        let result = order.items()[0].result.as_ref().unwrap();
        assert_eq!(result.abnormal_flag, Some(AbnormalFlag::High));
    }

    #[test]
    fn unparsable_range_leaves_item_unclassified() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        step(
            &mut order,
            LabOrderCommand::CollectSample(CollectSample {
                tenant_id,
                order_id,
                actor: test_actor(),
                occurred_at: test_time(),
            }),
        );
        step(
            &mut order,
            LabOrderCommand::StartProcessing(StartProcessing {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );

        step(
            &mut order,
            LabOrderCommand::RecordItemResult(RecordItemResult {
                tenant_id,
                order_id,
                item_no: 1,
                value: "negative".to_string(),
                number: Some(5.0),
                unit: None,
                reference_range: Some("see note".to_string()),
                occurred_at: test_time(),
            }),
        );

        let result = order.items()[0].result.as_ref().unwrap();
        assert_eq!(result.abnormal_flag, None);
        assert_eq!(result.value, "negative");
    }

    #[test]
    fn completing_results_requires_every_item_recorded() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None), glucose()]);
        step(
            &mut order,
            LabOrderCommand::CollectSample(CollectSample {
                tenant_id,
                order_id,
                actor: test_actor(),
                occurred_at: test_time(),
            }),
        );
        step(
            &mut order,
            LabOrderCommand::StartProcessing(StartProcessing {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );

        let complete = LabOrderCommand::CompleteResults(CompleteResults {
            tenant_id,
            order_id,
            actor: test_actor(),
            occurred_at: test_time(),
        });
        let err = order.handle(&complete).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        record_all_results(&mut order);
        step(&mut order, complete);
        assert_eq!(order.status(), LabOrderStatus::Completed);
    }

    #[test]
    fn cancel_reachable_from_any_non_terminal_state() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        step(
            &mut order,
            LabOrderCommand::CollectSample(CollectSample {
                tenant_id,
                order_id,
                actor: test_actor(),
                occurred_at: test_time(),
            }),
        );

        step(
            &mut order,
            LabOrderCommand::CancelOrder(CancelOrder {
                tenant_id,
                order_id,
                reason: Some("specimen lost".to_string()),
                actor: test_actor(),
                occurred_at: test_time(),
            }),
        );
        assert_eq!(order.status(), LabOrderStatus::Cancelled);
        assert_eq!(order.cancel_reason(), Some("specimen lost"));
        // Collection already happened; the flag survives for reversal.
        assert!(order.sample_collected());
    }

    #[test]
    fn cancelled_order_rejects_cancel_again() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        let cancel = LabOrderCommand::CancelOrder(CancelOrder {
            tenant_id,
            order_id,
            reason: None,
            actor: test_actor(),
            occurred_at: test_time(),
        });

        step(&mut order, cancel.clone());
        let err = order.handle(&cancel).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn billing_record_links_once_at_delivery() {
        let tenant_id = test_tenant_id();
        let order_id = test_order_id();
        let mut order = created_order(tenant_id, order_id, vec![cbc(None)]);
        let actor = test_actor();

        // Linking before delivery is rejected.
        let link = LinkBillingRecord {
            tenant_id,
            order_id,
            billing_record_id: BillingRecordId::new(),
            occurred_at: test_time(),
        };
        let err = order
            .handle(&LabOrderCommand::LinkBillingRecord(link.clone()))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        step(
            &mut order,
            LabOrderCommand::CollectSample(CollectSample {
                tenant_id,
                order_id,
                actor,
                occurred_at: test_time(),
            }),
        );
        step(
            &mut order,
            LabOrderCommand::StartProcessing(StartProcessing {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );
        record_all_results(&mut order);
        step(
            &mut order,
            LabOrderCommand::CompleteResults(CompleteResults {
                tenant_id,
                order_id,
                actor,
                occurred_at: test_time(),
            }),
        );
        step(
            &mut order,
            LabOrderCommand::VerifyResults(VerifyResults {
                tenant_id,
                order_id,
                actor,
                occurred_at: test_time(),
            }),
        );
        step(
            &mut order,
            LabOrderCommand::MarkDelivered(MarkDelivered {
                tenant_id,
                order_id,
                occurred_at: test_time(),
            }),
        );

        step(&mut order, LabOrderCommand::LinkBillingRecord(link.clone()));
        assert!(order.billing_record_id().is_some());

        // Second link is a conflict; the synthesis step treats it as a NoOp.
        let err = order
            .handle(&LabOrderCommand::LinkBillingRecord(link))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn billable_lines_map_items_one_to_one() {
        let order = created_order(
            test_tenant_id(),
            test_order_id(),
            vec![cbc(None), glucose()],
        );
        let lines = order.billable_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].description, "Complete Blood Count");
        assert_eq!(lines[0].quantity, 1);
        assert_eq!(lines[0].unit_price, 1500);
        assert_eq!(lines[1].description, "Fasting Glucose");
        assert_eq!(lines[1].unit_price, 800);
    }

    #[test]
    fn wrong_tenant_is_rejected() {
        let order = created_order(test_tenant_id(), test_order_id(), vec![cbc(None)]);
        let err = order
            .handle(&LabOrderCommand::CollectSample(CollectSample {
                tenant_id: test_tenant_id(),
                order_id: order.id_typed(),
                actor: test_actor(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
