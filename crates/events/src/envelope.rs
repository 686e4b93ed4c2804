use serde::{Deserialize, Serialize};
use uuid::Uuid;

use medforge_core::{AggregateId, TenantId};

/// A committed event wrapped with its stream metadata, ready for publication.
///
/// The envelope is what consumers (projections, read-only collaborators) see:
/// the tenant, the stream the event belongs to, its position within that
/// stream, and the payload. The tenant id rides in the envelope itself so a
/// consumer can enforce isolation without parsing the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// The stream this event belongs to: (tenant, aggregate).
    ///
    /// Streams are keyed by both halves; consumers tracking per-stream cursors
    /// key them on this pair, never on the aggregate id alone.
    pub fn stream(&self) -> (TenantId, AggregateId) {
        (self.tenant_id, self.aggregate_id)
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
