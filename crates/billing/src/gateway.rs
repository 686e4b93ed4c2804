//! Billing collaborator abstraction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use medforge_core::TenantId;

use crate::record::{BillingRecordId, BillingRequest};

/// Billing collaborator failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingGatewayError {
    /// The collaborator rejected the request (deterministic; retrying the same
    /// request will fail again).
    #[error("billing request rejected: {0}")]
    Rejected(String),

    /// The collaborator was unreachable (transient; safe to retry).
    #[error("billing collaborator unreachable: {0}")]
    Unreachable(String),
}

/// External billing collaborator.
///
/// Treated as an at-least-once-callable dependency: the gateway may be invoked
/// more than once for the same clinical event, so callers perform their own
/// idempotency check before calling.
pub trait BillingGateway: Send + Sync {
    fn create_record(&self, request: &BillingRequest) -> Result<BillingRecordId, BillingGatewayError>;
}

impl<G> BillingGateway for Arc<G>
where
    G: BillingGateway + ?Sized,
{
    fn create_record(&self, request: &BillingRequest) -> Result<BillingRecordId, BillingGatewayError> {
        (**self).create_record(request)
    }
}

/// In-memory billing gateway for tests/dev.
///
/// Records every accepted request and supports simulating an unreachable
/// collaborator via `set_unreachable`.
#[derive(Debug, Default)]
pub struct InMemoryBillingGateway {
    records: RwLock<Vec<(BillingRecordId, BillingRequest)>>,
    unreachable: AtomicBool,
}

impl InMemoryBillingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outage for subsequent `create_record` calls.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// All records accepted for a tenant, in creation order.
    pub fn records_for(&self, tenant_id: TenantId) -> Vec<(BillingRecordId, BillingRequest)> {
        self.records
            .read()
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, req)| req.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}

impl BillingGateway for InMemoryBillingGateway {
    fn create_record(&self, request: &BillingRequest) -> Result<BillingRecordId, BillingGatewayError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BillingGatewayError::Unreachable(
                "simulated outage".to_string(),
            ));
        }

        let record_id = BillingRecordId::new();
        self.records
            .write()
            .map_err(|_| BillingGatewayError::Unreachable("lock poisoned".to_string()))?
            .push((record_id, request.clone()));
        Ok(record_id)
    }
}
