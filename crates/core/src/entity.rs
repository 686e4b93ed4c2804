//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Entities owned by an aggregate (e.g. an ordered test, a dispensing line)
/// implement this so they stay addressable as the aggregate evolves.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
