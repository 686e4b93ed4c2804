//! Value object trait: equality by value, not identity.

/// Marker trait for immutable domain values compared by their attributes.
///
/// A `StockMovement` or a billing line item is a value object: two with the
/// same fields are interchangeable. Entities, by contrast, are the same thing
/// only when their IDs match.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
