use chrono::{DateTime, Utc};

/// A domain event: an immutable fact about something that happened in a
/// clinical workflow.
///
/// Implementors are append-only by convention: once decided by an aggregate
/// and committed, an event is never rewritten. `version` exists for schema
/// evolution of persisted payloads.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "laboratory.order.sample_collected").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time, not commit time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
