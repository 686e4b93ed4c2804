use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use medforge_core::{AggregateId, ExpectedVersion, TenantId};
use medforge_events::Event;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Lifecycle: domain event → `UncommittedEvent` (wrapped with stream metadata)
/// → `StoredEvent` (assigned a sequence number) → `EventEnvelope` (published).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    ///
    /// Serializes the payload to JSON and carries the event metadata needed to
    /// deserialize it back during rehydration.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are stream-scoped (tenant + aggregate), monotonically
/// increasing, and immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into a tenant-scoped event envelope for publication.
    pub fn to_envelope(&self) -> medforge_events::EventEnvelope<JsonValue> {
        medforge_events::EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// One stream's contribution to a multi-stream atomic append.
#[derive(Debug, Clone)]
pub struct StreamAppend {
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

/// Event store operation error (infrastructure, not domain).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Optimistic concurrency check failed (version mismatch).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Cross-tenant access attempted.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Event type doesn't match the stream's aggregate type.
    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    /// Invalid event data or stream state.
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Payload (de)serialization failed.
    #[error("event serialization failed: {0}")]
    Serialization(String),
}

/// Append-only, tenant-scoped event store.
///
/// Streams are keyed by (tenant, aggregate); the tenant is part of every key,
/// so cross-tenant reads or appends are structurally impossible rather than
/// filtered per query.
pub trait EventStore: Send + Sync {
    /// Append events to a single stream with an optimistic concurrency check.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_multi(vec![StreamAppend {
            expected_version,
            events,
        }])
    }

    /// Atomically append to several streams: every per-stream expected
    /// version must hold and every event lands, or nothing is written.
    ///
    /// This is the unit of work backing transitions that touch more than one
    /// aggregate (a status change plus its ledger movements).
    fn append_multi(&self, batches: Vec<StreamAppend>)
    -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for one (tenant, aggregate).
    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append_multi(
        &self,
        batches: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_multi(batches)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id)
    }
}
