//! Durable retry queue for failed billing synthesis.
//!
//! A failed gateway call represents an unbilled clinical service; the request
//! is parked here for redrive/operator attention instead of being discarded.
//! The triggering clinical transition is never rolled back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medforge_billing::BillingRequest;
use medforge_core::TenantId;
use medforge_laboratory::LabOrderId;
use medforge_pharmacy::DispensingId;

/// The clinical aggregate a parked billing request originated from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SynthesisSource {
    LabOrder { order_id: LabOrderId },
    Dispensing { dispensing_id: DispensingId },
}

/// A billing request awaiting redrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSynthesis {
    pub tenant_id: TenantId,
    pub source: SynthesisSource,
    pub request: BillingRequest,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("outbox storage failure: {0}")]
    Storage(String),
}

/// Billing retry queue abstraction.
///
/// FIFO per process; a production implementation backs this with a durable
/// table the operator tooling can inspect.
pub trait BillingRetryQueue: Send + Sync {
    fn enqueue(&self, pending: PendingSynthesis) -> Result<(), OutboxError>;

    /// Claim the oldest pending entry, removing it from the queue.
    fn claim_next(&self) -> Result<Option<PendingSynthesis>, OutboxError>;

    /// Inspect pending entries for a tenant without claiming them.
    fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingSynthesis>, OutboxError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Q> BillingRetryQueue for Arc<Q>
where
    Q: BillingRetryQueue + ?Sized,
{
    fn enqueue(&self, pending: PendingSynthesis) -> Result<(), OutboxError> {
        (**self).enqueue(pending)
    }

    fn claim_next(&self) -> Result<Option<PendingSynthesis>, OutboxError> {
        (**self).claim_next()
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingSynthesis>, OutboxError> {
        (**self).list(tenant_id)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// In-memory billing retry queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBillingRetryQueue {
    entries: Mutex<VecDeque<PendingSynthesis>>,
}

impl InMemoryBillingRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BillingRetryQueue for InMemoryBillingRetryQueue {
    fn enqueue(&self, pending: PendingSynthesis) -> Result<(), OutboxError> {
        self.entries
            .lock()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?
            .push_back(pending);
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<PendingSynthesis>, OutboxError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?
            .pop_front())
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingSynthesis>, OutboxError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?
            .iter()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use medforge_core::{AggregateId, PatientId};

    use super::*;
    use medforge_billing::BillingLineItem;

    fn pending(tenant_id: TenantId) -> PendingSynthesis {
        PendingSynthesis {
            tenant_id,
            source: SynthesisSource::LabOrder {
                order_id: LabOrderId::new(AggregateId::new()),
            },
            request: BillingRequest::new(
                tenant_id,
                PatientId::new(),
                "Laboratory order LAB-20260208-0001",
                Utc::now(),
                vec![BillingLineItem {
                    description: "Complete Blood Count".to_string(),
                    quantity: 1,
                    unit_price: 1500,
                }],
            )
            .unwrap(),
            attempts: 1,
            last_error: "simulated outage".to_string(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn claims_in_fifo_order() {
        let queue = InMemoryBillingRetryQueue::new();
        let tenant_id = TenantId::new();

        let first = pending(tenant_id);
        let mut second = pending(tenant_id);
        second.attempts = 2;

        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.claim_next().unwrap(), Some(first));
        assert_eq!(queue.claim_next().unwrap(), Some(second));
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn list_filters_by_tenant() {
        let queue = InMemoryBillingRetryQueue::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        queue.enqueue(pending(tenant_a)).unwrap();
        queue.enqueue(pending(tenant_b)).unwrap();

        assert_eq!(queue.list(tenant_a).unwrap().len(), 1);
        assert_eq!(queue.list(tenant_b).unwrap().len(), 1);
        // Listing claims nothing.
        assert_eq!(queue.len(), 2);
    }
}
