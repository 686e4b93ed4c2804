//! Scoped, collision-free identifier issuance.
//!
//! The generator produces human-readable identifiers of the form
//! `PREFIX-YYYYMMDD-0001`, unique per (prefix, tenant, day) scope under
//! concurrent callers. Correctness hinges on the backing store performing an
//! atomic reserve-and-increment: the naive read-highest/parse/increment/write
//! strategy is a lost-update race and is not expressible through this trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use thiserror::Error;

use medforge_core::TenantId;

use crate::scope::ScopeKey;

/// Highest ordinal representable in the 4-digit suffix.
pub const MAX_ORDINAL: u32 = 9_999;

/// Bounded transparent retries on store-level conflicts before surfacing.
const RESERVE_RETRY_BUDGET: u32 = 5;

/// Sequence issuance error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// The scope's ordinal space is used up (> `MAX_ORDINAL` issued in one day).
    #[error("sequence exhausted for scope {scope} (max {max})")]
    Exhausted { scope: String, max: u32 },

    /// Store conflicts persisted past the retry budget.
    #[error("retry budget exceeded reserving ordinal for scope {scope}: {detail}")]
    RetryBudgetExceeded { scope: String, detail: String },

    /// Backing store failure.
    #[error("sequence storage failure: {0}")]
    Storage(String),
}

/// Store-level reservation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceStoreError {
    /// Optimistic implementations report contention here; retried by the generator.
    #[error("reservation conflict: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Scoped counter store.
///
/// `reserve` must atomically increment the scope's counter and return the new
/// ordinal (first reservation returns 1). Backed by a database sequence,
/// compare-and-swap row, or serializable transaction in production; a mutexed
/// map in tests/dev.
pub trait SequenceStore: Send + Sync {
    fn reserve(&self, scope: &ScopeKey) -> Result<u32, SequenceStoreError>;
}

impl<S> SequenceStore for Arc<S>
where
    S: SequenceStore + ?Sized,
{
    fn reserve(&self, scope: &ScopeKey) -> Result<u32, SequenceStoreError> {
        (**self).reserve(scope)
    }
}

/// In-memory scoped counter store for tests/dev.
///
/// A single mutex serializes all reservations; increments can never be lost.
#[derive(Debug, Default)]
pub struct InMemorySequenceStore {
    counters: Mutex<HashMap<ScopeKey, u32>>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceStore for InMemorySequenceStore {
    fn reserve(&self, scope: &ScopeKey) -> Result<u32, SequenceStoreError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| SequenceStoreError::Storage("lock poisoned".to_string()))?;

        let counter = counters.entry(scope.clone()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

/// Issues scoped, monotonically increasing, human-readable identifiers.
#[derive(Debug)]
pub struct SequenceGenerator<S> {
    store: S,
}

impl<S> SequenceGenerator<S>
where
    S: SequenceStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Issue the next identifier for (prefix, tenant, day).
    ///
    /// Store conflicts are retried up to a bounded budget before surfacing;
    /// ordinal overflow surfaces `SequenceError::Exhausted`.
    pub fn next(
        &self,
        prefix: &str,
        tenant_id: TenantId,
        day: NaiveDate,
    ) -> Result<String, SequenceError> {
        let scope = ScopeKey::new(prefix, tenant_id, day);

        let mut last_conflict = String::new();
        for _ in 0..RESERVE_RETRY_BUDGET {
            match self.store.reserve(&scope) {
                Ok(ordinal) if ordinal > MAX_ORDINAL => {
                    return Err(SequenceError::Exhausted {
                        scope: scope.to_string(),
                        max: MAX_ORDINAL,
                    });
                }
                Ok(ordinal) => return Ok(format_code(prefix, day, ordinal)),
                Err(SequenceStoreError::Conflict(detail)) => {
                    last_conflict = detail;
                }
                Err(SequenceStoreError::Storage(detail)) => {
                    return Err(SequenceError::Storage(detail));
                }
            }
        }

        Err(SequenceError::RetryBudgetExceeded {
            scope: scope.to_string(),
            detail: last_conflict,
        })
    }
}

/// Format an issued ordinal as `PREFIX-YYYYMMDD-NNNN`.
pub fn format_code(prefix: &str, day: NaiveDate, ordinal: u32) -> String {
    format!("{}-{}-{:04}", prefix, day.format("%Y%m%d"), ordinal)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::scope::prefix;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 8).unwrap()
    }

    #[test]
    fn first_issue_is_ordinal_one() {
        let generator = SequenceGenerator::new(InMemorySequenceStore::new());
        let code = generator
            .next(prefix::VISIT, test_tenant_id(), test_day())
            .unwrap();
        assert_eq!(code, "VIS-20260208-0001");
    }

    #[test]
    fn ordinals_increase_within_a_scope() {
        let generator = SequenceGenerator::new(InMemorySequenceStore::new());
        let tenant_id = test_tenant_id();

        let first = generator.next(prefix::LAB_ORDER, tenant_id, test_day()).unwrap();
        let second = generator.next(prefix::LAB_ORDER, tenant_id, test_day()).unwrap();
        let third = generator.next(prefix::LAB_ORDER, tenant_id, test_day()).unwrap();

        assert_eq!(first, "LAB-20260208-0001");
        assert_eq!(second, "LAB-20260208-0002");
        assert_eq!(third, "LAB-20260208-0003");
    }

    #[test]
    fn scopes_are_independent() {
        let generator = SequenceGenerator::new(InMemorySequenceStore::new());
        let tenant_a = test_tenant_id();
        let tenant_b = test_tenant_id();
        let day = test_day();
        let next_day = day.succ_opt().unwrap();

        assert_eq!(
            generator.next(prefix::VISIT, tenant_a, day).unwrap(),
            "VIS-20260208-0001"
        );
        // Different prefix, tenant, or day each start back at 0001.
        assert_eq!(
            generator.next(prefix::DISPENSING, tenant_a, day).unwrap(),
            "DSP-20260208-0001"
        );
        assert_eq!(
            generator.next(prefix::VISIT, tenant_b, day).unwrap(),
            "VIS-20260208-0001"
        );
        assert_eq!(
            generator.next(prefix::VISIT, tenant_a, next_day).unwrap(),
            "VIS-20260209-0001"
        );
    }

    #[test]
    fn exhausted_scope_is_surfaced() {
        let generator = SequenceGenerator::new(InMemorySequenceStore::new());
        let tenant_id = test_tenant_id();

        for _ in 0..MAX_ORDINAL {
            generator
                .next(prefix::PRESCRIPTION, tenant_id, test_day())
                .unwrap();
        }

        let err = generator
            .next(prefix::PRESCRIPTION, tenant_id, test_day())
            .unwrap_err();
        assert!(matches!(err, SequenceError::Exhausted { .. }));
    }

    #[test]
    fn concurrent_issues_are_pairwise_distinct() {
        let generator = Arc::new(SequenceGenerator::new(Arc::new(InMemorySequenceStore::new())));
        let tenant_id = test_tenant_id();
        let day = test_day();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            handles.push(std::thread::spawn(move || {
                let mut issued = Vec::new();
                for _ in 0..50 {
                    issued.push(generator.next(prefix::LAB_ORDER, tenant_id, day).unwrap());
                }
                issued
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let distinct: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(distinct.len(), all.len());
        assert_eq!(all.len(), 400);
        // Exactly one caller got the first ordinal.
        assert_eq!(
            all.iter().filter(|c| *c == "LAB-20260208-0001").count(),
            1
        );
    }

    /// Store that reports a conflict on the first few reservations, as an
    /// optimistic (compare-and-swap) backend would under contention.
    struct ContentiousStore {
        inner: InMemorySequenceStore,
        conflicts_left: AtomicU32,
    }

    impl SequenceStore for ContentiousStore {
        fn reserve(&self, scope: &ScopeKey) -> Result<u32, SequenceStoreError> {
            if self.conflicts_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(SequenceStoreError::Conflict("simulated contention".to_string()));
            }
            self.inner.reserve(scope)
        }
    }

    #[test]
    fn conflicts_are_retried_within_budget() {
        let store = ContentiousStore {
            inner: InMemorySequenceStore::new(),
            conflicts_left: AtomicU32::new(3),
        };
        let generator = SequenceGenerator::new(store);

        let code = generator
            .next(prefix::CONSULTATION, test_tenant_id(), test_day())
            .unwrap();
        assert_eq!(code, "CON-20260208-0001");
    }

    #[test]
    fn persistent_conflict_exceeds_retry_budget() {
        let store = ContentiousStore {
            inner: InMemorySequenceStore::new(),
            conflicts_left: AtomicU32::new(u32::MAX),
        };
        let generator = SequenceGenerator::new(store);

        let err = generator
            .next(prefix::CONSULTATION, test_tenant_id(), test_day())
            .unwrap_err();
        assert!(matches!(err, SequenceError::RetryBudgetExceeded { .. }));
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Property: any number of sequential issues within one scope yields
            /// pairwise-distinct, lexicographically increasing identifiers.
            #[test]
            fn sequential_issues_are_distinct_and_increasing(count in 1usize..200) {
                let generator = SequenceGenerator::new(InMemorySequenceStore::new());
                let tenant_id = TenantId::new();
                let day = NaiveDate::from_ymd_opt(2026, 2, 8).unwrap();

                let mut previous: Option<String> = None;
                for _ in 0..count {
                    let code = generator.next(prefix::VISIT, tenant_id, day).unwrap();
                    if let Some(prev) = &previous {
                        prop_assert!(code > *prev);
                    }
                    previous = Some(code);
                }
            }
        }
    }
}
