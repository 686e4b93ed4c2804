use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use medforge_core::{AggregateId, TenantId};
use medforge_events::EventEnvelope;
use medforge_inventory::{ProductEvent, ProductId, ProductKind};

use crate::read_model::TenantStore;

/// Queryable stock read model: live quantity + low-stock flag per product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevelReadModel {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    /// `None` for services.
    pub low_stock_threshold: Option<i64>,
}

impl StockLevelReadModel {
    pub fn is_low_stock(&self) -> bool {
        self.low_stock_threshold
            .is_some_and(|threshold| self.quantity <= threshold)
    }
}

/// Tenant+aggregate cursor to support at-least-once delivery (idempotent projection).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum StockProjectionError {
    #[error("failed to deserialize product event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock level projection.
///
/// Consumes published envelopes (JSON payloads) and maintains a
/// tenant-isolated read model. Disposable and rebuildable from the stream.
#[derive(Debug)]
pub struct StockLevelProjection<S>
where
    S: TenantStore<ProductId, StockLevelReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> StockLevelProjection<S>
where
    S: TenantStore<ProductId, StockLevelReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Query the read model for one tenant/product.
    pub fn get(&self, tenant_id: TenantId, product_id: &ProductId) -> Option<StockLevelReadModel> {
        self.store.get(tenant_id, product_id)
    }

    /// List all products for a tenant.
    pub fn list(&self, tenant_id: TenantId) -> Vec<StockLevelReadModel> {
        self.store.list(tenant_id)
    }

    /// Products at or below their low-stock threshold (reorder report).
    pub fn low_stock(&self, tenant_id: TenantId) -> Vec<StockLevelReadModel> {
        let mut low: Vec<StockLevelReadModel> = self
            .store
            .list(tenant_id)
            .into_iter()
            .filter(StockLevelReadModel::is_low_stock)
            .collect();
        low.sort_by(|a, b| a.sku.cmp(&b.sku));
        low
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Enforces tenant isolation at the event level
    /// - Enforces monotonic sequence per (tenant, aggregate) stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    ///
    /// Envelopes from other aggregates are ignored.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StockProjectionError> {
        if envelope.aggregate_type() != "inventory.product" {
            return Ok(());
        }

        let (tenant_id, aggregate_id) = envelope.stream();
        let seq = envelope.sequence_number();

        let mut cursors = match self.cursors.write() {
            Ok(cursors) => cursors,
            Err(_) => return Ok(()),
        };
        let key = CursorKey {
            tenant_id,
            aggregate_id,
        };
        let last = *cursors.get(&key).unwrap_or(&0);

        if seq == 0 {
            return Err(StockProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(StockProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: ProductEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| StockProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, product_id) = match &event {
            ProductEvent::ProductCreated(e) => (e.tenant_id, e.product_id),
            ProductEvent::StockAdjusted(e) => (e.tenant_id, e.movement.product_id),
        };
        if event_tenant != tenant_id {
            return Err(StockProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if product_id.0 != aggregate_id {
            return Err(StockProjectionError::TenantIsolation(
                "event product_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match event {
            ProductEvent::ProductCreated(e) => {
                self.store.upsert(
                    tenant_id,
                    e.product_id,
                    StockLevelReadModel {
                        product_id: e.product_id,
                        sku: e.sku,
                        name: e.name,
                        quantity: 0,
                        low_stock_threshold: match e.kind {
                            ProductKind::Stockable { low_stock_threshold } => {
                                Some(low_stock_threshold)
                            }
                            ProductKind::Service => None,
                        },
                    },
                );
            }
            ProductEvent::StockAdjusted(e) => {
                if let Some(mut model) = self.store.get(tenant_id, &product_id) {
                    model.quantity += e.movement.delta;
                    self.store.upsert(tenant_id, product_id, model);
                }
            }
        }

        cursors.insert(key, seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use medforge_core::StaffId;
    use medforge_inventory::{ProductCreated, StockAdjusted, StockMovement, StockMovementKind};
    use uuid::Uuid;

    use super::*;
    use crate::read_model::InMemoryTenantStore;

    type TestProjection =
        StockLevelProjection<Arc<InMemoryTenantStore<ProductId, StockLevelReadModel>>>;

    fn setup() -> TestProjection {
        StockLevelProjection::new(Arc::new(InMemoryTenantStore::new()))
    }

    fn created_envelope(
        tenant_id: TenantId,
        product_id: ProductId,
        threshold: i64,
        seq: u64,
    ) -> EventEnvelope<JsonValue> {
        let event = ProductEvent::ProductCreated(ProductCreated {
            tenant_id,
            product_id,
            sku: "AMOX-500".to_string(),
            name: "Amoxicillin 500mg".to_string(),
            kind: ProductKind::Stockable {
                low_stock_threshold: threshold,
            },
            occurred_at: Utc::now(),
        });
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            product_id.0,
            "inventory.product",
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    fn adjusted_envelope(
        tenant_id: TenantId,
        product_id: ProductId,
        delta: i64,
        seq: u64,
    ) -> EventEnvelope<JsonValue> {
        let event = ProductEvent::StockAdjusted(StockAdjusted {
            tenant_id,
            movement: StockMovement {
                product_id,
                delta,
                kind: StockMovementKind::Purchase,
                reference: "TXN-0001".to_string(),
                actor: StaffId::new(),
                notes: None,
                occurred_at: Utc::now(),
            },
        });
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            product_id.0,
            "inventory.product",
            seq,
            serde_json::to_value(&event).unwrap(),
        )
    }

    #[test]
    fn builds_quantity_from_movements() {
        let projection = setup();
        let tenant_id = TenantId::new();
        let product_id = ProductId::new(AggregateId::new());

        projection
            .apply_envelope(&created_envelope(tenant_id, product_id, 5, 1))
            .unwrap();
        projection
            .apply_envelope(&adjusted_envelope(tenant_id, product_id, 20, 2))
            .unwrap();
        projection
            .apply_envelope(&adjusted_envelope(tenant_id, product_id, -4, 3))
            .unwrap();

        let model = projection.get(tenant_id, &product_id).unwrap();
        assert_eq!(model.quantity, 16);
        assert!(!model.is_low_stock());
    }

    #[test]
    fn replayed_envelopes_are_ignored() {
        let projection = setup();
        let tenant_id = TenantId::new();
        let product_id = ProductId::new(AggregateId::new());

        projection
            .apply_envelope(&created_envelope(tenant_id, product_id, 5, 1))
            .unwrap();
        let adjustment = adjusted_envelope(tenant_id, product_id, 10, 2);
        projection.apply_envelope(&adjustment).unwrap();
        // At-least-once bus delivered the same envelope twice.
        projection.apply_envelope(&adjustment).unwrap();

        let model = projection.get(tenant_id, &product_id).unwrap();
        assert_eq!(model.quantity, 10);
    }

    #[test]
    fn low_stock_report_flags_threshold_breaches() {
        let projection = setup();
        let tenant_id = TenantId::new();
        let product_id = ProductId::new(AggregateId::new());

        projection
            .apply_envelope(&created_envelope(tenant_id, product_id, 5, 1))
            .unwrap();
        projection
            .apply_envelope(&adjusted_envelope(tenant_id, product_id, 5, 2))
            .unwrap();

        let low = projection.low_stock(tenant_id);
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].product_id, product_id);
    }

    #[test]
    fn read_models_are_tenant_isolated() {
        let projection = setup();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let product_id = ProductId::new(AggregateId::new());

        projection
            .apply_envelope(&created_envelope(tenant_a, product_id, 5, 1))
            .unwrap();

        assert!(projection.get(tenant_b, &product_id).is_none());
        assert!(projection.list(tenant_b).is_empty());
    }

    #[test]
    fn mismatched_event_tenant_is_rejected() {
        let projection = setup();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let product_id = ProductId::new(AggregateId::new());

        // Envelope claims tenant B but the payload belongs to tenant A.
        let event = ProductEvent::ProductCreated(ProductCreated {
            tenant_id: tenant_a,
            product_id,
            sku: "AMOX-500".to_string(),
            name: "Amoxicillin 500mg".to_string(),
            kind: ProductKind::Service,
            occurred_at: Utc::now(),
        });
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            tenant_b,
            product_id.0,
            "inventory.product",
            1,
            serde_json::to_value(&event).unwrap(),
        );

        let err = projection.apply_envelope(&envelope).unwrap_err();
        assert!(matches!(err, StockProjectionError::TenantIsolation(_)));
    }
}
