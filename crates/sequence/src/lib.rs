//! `medforge-sequence` — scoped sequential identifier issuance.
//!
//! Produces collision-free, human-readable codes (`VIS-20260208-0001`) per
//! (prefix, tenant, calendar day) scope, backed by an atomically-incrementing
//! counter store.

pub mod generator;
pub mod scope;

pub use generator::{
    InMemorySequenceStore, MAX_ORDINAL, SequenceError, SequenceGenerator, SequenceStore,
    SequenceStoreError, format_code,
};
pub use scope::{ScopeKey, prefix};
