//! `medforge-infra` — orchestration over the pure clinical domain.
//!
//! Event store + dispatcher pipeline, atomic multi-aggregate units of work,
//! workflow services, billing synthesis with its retry queue, and read-model
//! projections. Persistence backends beyond the in-memory store are wired
//! elsewhere; domain crates stay IO-free.

pub mod billing_outbox;
pub mod command_dispatcher;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod services;


pub use billing_outbox::{
    BillingRetryQueue, InMemoryBillingRetryQueue, OutboxError, PendingSynthesis, SynthesisSource,
};
pub use command_dispatcher::{AggregateDecision, CommandDispatcher, DispatchError};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, StoredEvent, StreamAppend, UncommittedEvent,
};
pub use services::billing_synthesis::SynthesisError;
pub use services::{
    BillingConfig, BillingSynthesis, LaboratoryService, PharmacyService, RedriveOutcome,
    ServiceError, SynthesisOutcome, VisitService,
};
