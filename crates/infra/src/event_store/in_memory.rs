use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use medforge_core::{AggregateId, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. One write lock covers the whole map, which is what
/// makes `append_multi` genuinely all-or-nothing: every expected version is
/// checked before the first event lands.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Validate one batch: non-empty, single tenant + aggregate + type.
    fn batch_key(batch: &StreamAppend) -> Result<(StreamKey, String), EventStoreError> {
        let first = batch.events.first().ok_or_else(|| {
            EventStoreError::InvalidAppend("batch contains no events".to_string())
        })?;
        let tenant_id = first.tenant_id;
        let aggregate_id = first.aggregate_id;
        let aggregate_type = first.aggregate_type.clone();

        for (idx, e) in batch.events.iter().enumerate() {
            if e.tenant_id != tenant_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "batch contains multiple tenant_ids (index {idx})"
                )));
            }
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        Ok((
            StreamKey {
                tenant_id,
                aggregate_id,
            },
            aggregate_type,
        ))
    }
}

impl EventStore for InMemoryEventStore {
    fn append_multi(
        &self,
        batches: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batches: Vec<StreamAppend> = batches
            .into_iter()
            .filter(|b| !b.events.is_empty())
            .collect();
        if batches.is_empty() {
            return Ok(vec![]);
        }

        // Validate batches and reject duplicate streams in one unit (two
        // expected-version checks against the same stream are ambiguous).
        let mut keys = Vec::with_capacity(batches.len());
        let mut seen = HashSet::new();
        for batch in &batches {
            let (key, aggregate_type) = Self::batch_key(batch)?;
            if !seen.insert(key) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "unit targets stream {} twice",
                    key.aggregate_id
                )));
            }
            keys.push((key, aggregate_type));
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // Phase 1: check every expected version and type before writing anything.
        for (batch, (key, aggregate_type)) in batches.iter().zip(&keys) {
            let stream = streams.get(key).map(Vec::as_slice).unwrap_or(&[]);
            let current = Self::current_version(stream);

            if !batch.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    key.aggregate_id, batch.expected_version
                )));
            }

            if let Some(existing) = stream.first() {
                if existing.aggregate_type != *aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing.aggregate_type, aggregate_type
                    )));
                }
            }
        }

        // Phase 2: assign sequence numbers and append (append-only).
        let mut committed = Vec::new();
        for (batch, (key, _)) in batches.into_iter().zip(keys) {
            let stream = streams.entry(key).or_default();
            let mut next = Self::current_version(stream) + 1;
            for e in batch.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    tenant_id: e.tenant_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use medforge_core::ExpectedVersion;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::event_store::UncommittedEvent;

    fn uncommitted(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.event".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn append_assigns_monotonic_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        let committed = store
            .append(
                vec![
                    uncommitted(tenant_id, aggregate_id, "test.agg"),
                    uncommitted(tenant_id, aggregate_id, "test.agg"),
                ],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(committed[1].sequence_number, 2);

        let committed = store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test.agg")],
                ExpectedVersion::Exact(2),
            )
            .unwrap();
        assert_eq!(committed[0].sequence_number, 3);
    }

    #[test]
    fn stale_expected_version_is_rejected() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test.agg")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let err = store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test.agg")],
                ExpectedVersion::Exact(0),
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn multi_stream_append_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let stream_a = AggregateId::new();
        let stream_b = AggregateId::new();

        // Seed stream B so an Exact(0) expectation on it fails.
        store
            .append(
                vec![uncommitted(tenant_id, stream_b, "test.agg")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let err = store
            .append_multi(vec![
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(tenant_id, stream_a, "test.agg")],
                },
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(tenant_id, stream_b, "test.agg")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        // Nothing landed on stream A even though its own check would have passed.
        assert!(store.load_stream(tenant_id, stream_a).unwrap().is_empty());
        assert_eq!(store.load_stream(tenant_id, stream_b).unwrap().len(), 1);
    }

    #[test]
    fn multi_stream_append_commits_every_stream() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let stream_a = AggregateId::new();
        let stream_b = AggregateId::new();

        let committed = store
            .append_multi(vec![
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(tenant_id, stream_a, "test.agg")],
                },
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![
                        uncommitted(tenant_id, stream_b, "test.agg"),
                        uncommitted(tenant_id, stream_b, "test.agg"),
                    ],
                },
            ])
            .unwrap();
        assert_eq!(committed.len(), 3);
        assert_eq!(store.load_stream(tenant_id, stream_a).unwrap().len(), 1);
        assert_eq!(store.load_stream(tenant_id, stream_b).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_stream_in_one_unit_is_rejected() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        let err = store
            .append_multi(vec![
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(tenant_id, aggregate_id, "test.agg")],
                },
                StreamAppend {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(tenant_id, aggregate_id, "test.agg")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[test]
    fn batches_mixing_tenants_are_rejected() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();

        let err = store
            .append(
                vec![
                    uncommitted(TenantId::new(), aggregate_id, "test.agg"),
                    uncommitted(TenantId::new(), aggregate_id, "test.agg"),
                ],
                ExpectedVersion::Exact(0),
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::TenantIsolation(_)));
    }

    #[test]
    fn streams_are_tenant_scoped() {
        let store = InMemoryEventStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![uncommitted(tenant_a, aggregate_id, "test.agg")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        // The same aggregate id under another tenant is a different stream.
        assert!(store.load_stream(tenant_b, aggregate_id).unwrap().is_empty());
    }

    #[test]
    fn aggregate_type_is_stable_across_a_stream() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();

        store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "test.agg")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let err = store
            .append(
                vec![uncommitted(tenant_id, aggregate_id, "other.agg")],
                ExpectedVersion::Exact(1),
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }
}
