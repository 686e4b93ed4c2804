//! `medforge-events` — event plumbing for the clinical domain.
//!
//! Event trait, tenant-scoped envelopes, pub/sub bus. No business rules live
//! here; read models over published events live in the infrastructure layer.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
