//! Command execution pipeline (application-level orchestration).
//!
//! Orchestrates the event-sourcing lifecycle for every clinical aggregate:
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store (tenant-scoped)
//!   ↓
//! 2. Rehydrate aggregate (apply history)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to bus (projections, read-only collaborators)
//! ```
//!
//! Transitions that touch more than one aggregate (a lab order collecting its
//! sample plus one ledger decrement per consumable) are composed from
//! [`CommandDispatcher::decide`] calls and committed through a single
//! multi-stream atomic append ([`CommandDispatcher::commit`]): every expected
//! version holds and every event lands, or nothing does.
//!
//! Optimistic conflicts are retried transparently a bounded number of times by
//! [`CommandDispatcher::run_unit`] / [`CommandDispatcher::dispatch_with_retry`]
//! before surfacing `DispatchError::ConcurrencyConflict`. No lock is held
//! between attempts; each retry reloads and re-decides.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use medforge_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use medforge_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// Transparent retries on optimistic conflicts before surfacing.
const CONFLICT_RETRY_BUDGET: u32 = 3;

/// Command execution error.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic-retry budget exceeded (or a single stale attempt surfaced).
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Tenant isolation violation (cross-tenant or cross-aggregate stream mixing).
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Disallowed state change (deterministic).
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Stock policy rejection (deterministic).
    #[error("insufficient stock: {0}")]
    InsufficientStock(String),

    /// Domain-level not found.
    #[error("not found")]
    NotFound,

    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("event deserialization failed: {0}")]
    Deserialize(String),

    /// Persisting to the event store failed.
    #[error("event store failure: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::ConcurrencyConflict(msg.clone()),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidTransition(msg) => DispatchError::InvalidTransition(msg),
            DomainError::InsufficientStock(msg) => DispatchError::InsufficientStock(msg),
            DomainError::Conflict(msg) => DispatchError::ConcurrencyConflict(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

impl DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::ConcurrencyConflict(_))
    }
}

/// One aggregate's decided-but-uncommitted contribution to a unit of work.
#[derive(Debug)]
pub struct AggregateDecision {
    expected_version: ExpectedVersion,
    uncommitted: Vec<UncommittedEvent>,
}

impl AggregateDecision {
    pub fn is_empty(&self) -> bool {
        self.uncommitted.is_empty()
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run against the in-memory pair and
/// production wires real backends without touching domain code.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate an aggregate without deciding anything.
    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Steps 1–3 of the pipeline: load, rehydrate, decide.
    ///
    /// Returns the rehydrated aggregate (state *before* the decided events)
    /// and the decision, ready to be composed into a unit and committed.
    pub fn decide<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: &A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<(A, AggregateDecision), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: medforge_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let expected_version = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        let decided = aggregate.handle(command).map_err(DispatchError::from)?;

        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((
            aggregate,
            AggregateDecision {
                expected_version,
                uncommitted,
            },
        ))
    }

    /// Steps 4–5 of the pipeline for a whole unit of work: one multi-stream
    /// atomic append, then publication of every committed event.
    pub fn commit(
        &self,
        decisions: Vec<AggregateDecision>,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let batches: Vec<StreamAppend> = decisions
            .into_iter()
            .filter(|d| !d.is_empty())
            .map(|d| StreamAppend {
                expected_version: d.expected_version,
                events: d.uncommitted,
            })
            .collect();
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let committed = self.store.append_multi(batches)?;

        // Publish after append: the store is the source of truth, a failed
        // publication leaves events re-publishable, not lost.
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }

    /// Single-aggregate convenience: decide + commit in one call.
    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: &A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: medforge_events::Event + Serialize + DeserializeOwned,
    {
        let (_, decision) = self.decide(
            tenant_id,
            aggregate_id,
            aggregate_type,
            command,
            make_aggregate,
        )?;
        self.commit(vec![decision])
    }

    /// Run a unit of work, transparently retrying on optimistic conflicts.
    ///
    /// The closure must be safe to re-run from scratch: it re-loads and
    /// re-decides on every attempt. Deterministic failures surface on the
    /// first attempt.
    pub fn run_unit<T>(
        &self,
        unit: impl Fn(&Self) -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let mut attempt = 0;
        loop {
            match unit(self) {
                Err(err) if err.is_retryable() && attempt < CONFLICT_RETRY_BUDGET => {
                    attempt += 1;
                    tracing::debug!(attempt, "retrying unit after optimistic conflict");
                }
                other => return other,
            }
        }
    }

    /// `dispatch` with bounded transparent retry on optimistic conflicts.
    pub fn dispatch_with_retry<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl Fn(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: medforge_events::Event + Serialize + DeserializeOwned,
    {
        self.run_unit(|dispatcher| {
            dispatcher.dispatch(
                tenant_id,
                aggregate_id,
                aggregate_type,
                command,
                &make_aggregate,
            )
        })
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Enforce tenant isolation even if a buggy backend returns cross-tenant
    // data, and require monotonically increasing sequence numbers.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
