use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medforge_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, StaffId, TenantId, ValueObject,
};
use medforge_events::Event;

/// Product identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Whether a product occupies shelf space or is a billed service.
///
/// An explicit tagged variant: code that needs to know whether stock applies
/// matches on this, it never probes for the presence of a quantity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProductKind {
    /// A stockable good; quantity tracked through the movement ledger.
    Stockable { low_stock_threshold: i64 },
    /// A non-stockable service; quantity is fixed at zero.
    Service,
}

/// Classification of a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockMovementKind {
    Purchase,
    Sale,
    Return,
    Adjustment,
}

/// Immutable record of one quantity change.
///
/// Movements are append-only facts: the live `stock_quantity` of a product is
/// always the signed sum of its movements since creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub product_id: ProductId,
    /// Signed quantity change (negative = consumption).
    pub delta: i64,
    pub kind: StockMovementKind,
    /// Causing-transaction reference (e.g. `DSP-20260208-0001`).
    pub reference: String,
    pub actor: StaffId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ValueObject for StockMovement {}

/// Aggregate root: Product.
///
/// The single mutation point for stock quantities. Every change goes through
/// `AdjustStock` and lands as a `StockAdjusted` event, so the movement append
/// and the live-quantity update are one unit by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    tenant_id: Option<TenantId>,
    sku: String,
    name: String,
    kind: ProductKind,
    stock_quantity: i64,
    version: u64,
    created: bool,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            tenant_id: None,
            sku: String::new(),
            name: String::new(),
            kind: ProductKind::Service,
            stock_quantity: 0,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProductKind {
        self.kind
    }

    pub fn stock_quantity(&self) -> i64 {
        self.stock_quantity
    }

    pub fn is_stockable(&self) -> bool {
        matches!(self.kind, ProductKind::Stockable { .. })
    }

    /// True for stockable products at or below their low-stock threshold.
    pub fn is_low_stock(&self) -> bool {
        match self.kind {
            ProductKind::Stockable { low_stock_threshold } => {
                self.stock_quantity <= low_stock_threshold
            }
            ProductKind::Service => false,
        }
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub kind: ProductKind,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub delta: i64,
    pub kind: StockMovementKind,
    pub reference: String,
    pub actor: StaffId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    AdjustStock(AdjustStock),
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub kind: ProductKind,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAdjusted.
///
/// Carries the full immutable movement record; nothing about a movement is
/// ever rewritten after this event is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub tenant_id: TenantId,
    pub movement: StockMovement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductEvent {
    ProductCreated(ProductCreated),
    StockAdjusted(StockAdjusted),
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::ProductCreated(_) => "inventory.product.created",
            ProductEvent::StockAdjusted(_) => "inventory.product.stock_adjusted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::ProductCreated(e) => e.occurred_at,
            ProductEvent::StockAdjusted(e) => e.movement.occurred_at,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::ProductCreated(e) => {
                self.id = e.product_id;
                self.tenant_id = Some(e.tenant_id);
                self.sku = e.sku.clone();
                self.name = e.name.clone();
                self.kind = e.kind;
                self.stock_quantity = 0;
                self.created = true;
            }
            ProductEvent::StockAdjusted(e) => {
                self.stock_quantity += e.movement.delta;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductCommand::CreateProduct(cmd) => self.handle_create(cmd),
            ProductCommand::AdjustStock(cmd) => self.handle_adjust(cmd),
        }
    }
}

impl Product {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::conflict("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_product_id(&self, product_id: ProductId) -> Result<(), DomainError> {
        if self.id != product_id {
            return Err(DomainError::conflict("product_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.sku.trim().is_empty() {
            return Err(DomainError::validation("SKU cannot be empty"));
        }
        if let ProductKind::Stockable { low_stock_threshold } = cmd.kind {
            if low_stock_threshold < 0 {
                return Err(DomainError::validation(
                    "low_stock_threshold cannot be negative",
                ));
            }
        }

        Ok(vec![ProductEvent::ProductCreated(ProductCreated {
            tenant_id: cmd.tenant_id,
            product_id: cmd.product_id,
            sku: cmd.sku.clone(),
            name: cmd.name.clone(),
            kind: cmd.kind,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<ProductEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_product_id(cmd.product_id)?;

        if !self.is_stockable() {
            return Err(DomainError::invalid_transition(
                "services do not carry stock",
            ));
        }
        if cmd.delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }
        if cmd.reference.trim().is_empty() {
            return Err(DomainError::validation(
                "movement reference cannot be empty",
            ));
        }

        let new_quantity = self
            .stock_quantity
            .checked_add(cmd.delta)
            .ok_or_else(|| DomainError::validation("stock quantity overflow"))?;
        if new_quantity < 0 {
            return Err(DomainError::insufficient_stock(format!(
                "product {} holds {}, adjustment of {} would leave {}",
                self.id, self.stock_quantity, cmd.delta, new_quantity
            )));
        }

        Ok(vec![ProductEvent::StockAdjusted(StockAdjusted {
            tenant_id: cmd.tenant_id,
            movement: StockMovement {
                product_id: cmd.product_id,
                delta: cmd.delta,
                kind: cmd.kind,
                reference: cmd.reference.clone(),
                actor: cmd.actor,
                notes: cmd.notes.clone(),
                occurred_at: cmd.occurred_at,
            },
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medforge_core::AggregateId;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_actor() -> StaffId {
        StaffId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn stockable(threshold: i64) -> ProductKind {
        ProductKind::Stockable {
            low_stock_threshold: threshold,
        }
    }

    fn created_product(tenant_id: TenantId, product_id: ProductId, kind: ProductKind) -> Product {
        let mut product = Product::empty(product_id);
        let events = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                tenant_id,
                product_id,
                sku: "AMOX-500".to_string(),
                name: "Amoxicillin 500mg".to_string(),
                kind,
                occurred_at: test_time(),
            }))
            .unwrap();
        product.apply(&events[0]);
        product
    }

    fn adjust(product: &mut Product, delta: i64, kind: StockMovementKind) -> ProductEvent {
        let events = product
            .handle(&ProductCommand::AdjustStock(AdjustStock {
                tenant_id: product.tenant_id().unwrap(),
                product_id: product.id_typed(),
                delta,
                kind,
                reference: "TXN-0001".to_string(),
                actor: test_actor(),
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap();
        let event = events[0].clone();
        product.apply(&event);
        event
    }

    #[test]
    fn create_product_emits_product_created_event() {
        let product = Product::empty(test_product_id());
        let tenant_id = test_tenant_id();
        let product_id = test_product_id();

        let events = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                tenant_id,
                product_id,
                sku: "CBC-TUBE".to_string(),
                name: "EDTA collection tube".to_string(),
                kind: stockable(5),
                occurred_at: test_time(),
            }))
            .unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            ProductEvent::ProductCreated(e) => {
                assert_eq!(e.tenant_id, tenant_id);
                assert_eq!(e.product_id, product_id);
                assert_eq!(e.sku, "CBC-TUBE");
                assert_eq!(e.kind, stockable(5));
            }
            _ => panic!("Expected ProductCreated event"),
        }
    }

    #[test]
    fn create_product_rejects_empty_name() {
        let product = Product::empty(test_product_id());
        let err = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                tenant_id: test_tenant_id(),
                product_id: test_product_id(),
                sku: "SKU-001".to_string(),
                name: "   ".to_string(),
                kind: ProductKind::Service,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_product_rejects_negative_threshold() {
        let product = Product::empty(test_product_id());
        let err = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                tenant_id: test_tenant_id(),
                product_id: test_product_id(),
                sku: "SKU-001".to_string(),
                name: "Gauze".to_string(),
                kind: stockable(-1),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn adjust_stock_folds_into_quantity() {
        let mut product = created_product(test_tenant_id(), test_product_id(), stockable(5));
        assert_eq!(product.stock_quantity(), 0);

        adjust(&mut product, 50, StockMovementKind::Purchase);
        assert_eq!(product.stock_quantity(), 50);

        adjust(&mut product, -3, StockMovementKind::Sale);
        assert_eq!(product.stock_quantity(), 47);

        adjust(&mut product, 3, StockMovementKind::Return);
        assert_eq!(product.stock_quantity(), 50);
    }

    #[test]
    fn movement_record_preserves_all_fields() {
        let tenant_id = test_tenant_id();
        let product_id = test_product_id();
        let mut product = created_product(tenant_id, product_id, stockable(0));
        adjust(&mut product, 10, StockMovementKind::Purchase);

        let actor = test_actor();
        let at = test_time();
        let events = product
            .handle(&ProductCommand::AdjustStock(AdjustStock {
                tenant_id,
                product_id,
                delta: -2,
                kind: StockMovementKind::Sale,
                reference: "DSP-20260208-0001".to_string(),
                actor,
                notes: Some("dispensed at front counter".to_string()),
                occurred_at: at,
            }))
            .unwrap();

        match &events[0] {
            ProductEvent::StockAdjusted(e) => {
                assert_eq!(e.movement.product_id, product_id);
                assert_eq!(e.movement.delta, -2);
                assert_eq!(e.movement.kind, StockMovementKind::Sale);
                assert_eq!(e.movement.reference, "DSP-20260208-0001");
                assert_eq!(e.movement.actor, actor);
                assert_eq!(e.movement.occurred_at, at);
            }
            _ => panic!("Expected StockAdjusted event"),
        }
    }

    #[test]
    fn adjust_rejects_driving_stock_negative() {
        let mut product = created_product(test_tenant_id(), test_product_id(), stockable(0));
        adjust(&mut product, 2, StockMovementKind::Purchase);

        let err = product
            .handle(&ProductCommand::AdjustStock(AdjustStock {
                tenant_id: product.tenant_id().unwrap(),
                product_id: product.id_typed(),
                delta: -3,
                kind: StockMovementKind::Sale,
                reference: "TXN-0002".to_string(),
                actor: test_actor(),
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
        // Rejected command leaves state untouched.
        assert_eq!(product.stock_quantity(), 2);
    }

    #[test]
    fn adjust_rejects_services() {
        let product = created_product(test_tenant_id(), test_product_id(), ProductKind::Service);

        let err = product
            .handle(&ProductCommand::AdjustStock(AdjustStock {
                tenant_id: product.tenant_id().unwrap(),
                product_id: product.id_typed(),
                delta: 1,
                kind: StockMovementKind::Purchase,
                reference: "TXN-0003".to_string(),
                actor: test_actor(),
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(product.stock_quantity(), 0);
    }

    #[test]
    fn adjust_rejects_zero_delta_and_empty_reference() {
        let product = created_product(test_tenant_id(), test_product_id(), stockable(0));
        let base = AdjustStock {
            tenant_id: product.tenant_id().unwrap(),
            product_id: product.id_typed(),
            delta: 0,
            kind: StockMovementKind::Adjustment,
            reference: "TXN-0004".to_string(),
            actor: test_actor(),
            notes: None,
            occurred_at: test_time(),
        };

        let err = product
            .handle(&ProductCommand::AdjustStock(base.clone()))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = product
            .handle(&ProductCommand::AdjustStock(AdjustStock {
                delta: 1,
                reference: " ".to_string(),
                ..base
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn adjust_rejects_wrong_tenant() {
        let product = created_product(test_tenant_id(), test_product_id(), stockable(0));

        let err = product
            .handle(&ProductCommand::AdjustStock(AdjustStock {
                tenant_id: test_tenant_id(),
                product_id: product.id_typed(),
                delta: 1,
                kind: StockMovementKind::Purchase,
                reference: "TXN-0005".to_string(),
                actor: test_actor(),
                notes: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn low_stock_flag_tracks_threshold() {
        let mut product = created_product(test_tenant_id(), test_product_id(), stockable(5));
        assert!(product.is_low_stock());

        adjust(&mut product, 6, StockMovementKind::Purchase);
        assert!(!product.is_low_stock());

        adjust(&mut product, -1, StockMovementKind::Sale);
        assert!(product.is_low_stock());
    }

    #[test]
    fn services_are_never_low_stock() {
        let product = created_product(test_tenant_id(), test_product_id(), ProductKind::Service);
        assert!(!product.is_low_stock());
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: at any point, stock_quantity equals the signed sum of
            /// the deltas of every accepted movement since creation.
            #[test]
            fn stock_equals_signed_sum_of_movements(
                deltas in prop::collection::vec(-20i64..60i64, 1..40)
            ) {
                let tenant_id = TenantId::new();
                let product_id = ProductId::new(AggregateId::new());
                let mut product = created_product(tenant_id, product_id, stockable(5));

                let mut accepted_sum: i64 = 0;
                for (i, delta) in deltas.into_iter().enumerate() {
                    let cmd = ProductCommand::AdjustStock(AdjustStock {
                        tenant_id,
                        product_id,
                        delta,
                        kind: if delta >= 0 {
                            StockMovementKind::Purchase
                        } else {
                            StockMovementKind::Sale
                        },
                        reference: format!("TXN-{i:04}"),
                        actor: StaffId::new(),
                        notes: None,
                        occurred_at: Utc::now(),
                    });

                    match product.handle(&cmd) {
                        Ok(events) => {
                            for event in &events {
                                product.apply(event);
                                if let ProductEvent::StockAdjusted(e) = event {
                                    accepted_sum += e.movement.delta;
                                }
                            }
                        }
                        Err(DomainError::InsufficientStock(_)) | Err(DomainError::Validation(_)) => {
                            // Rejected movement must leave the fold untouched.
                        }
                        Err(other) => return Err(TestCaseError::fail(format!("{other:?}"))),
                    }

                    prop_assert_eq!(product.stock_quantity(), accepted_sum);
                    prop_assert!(product.stock_quantity() >= 0);
                }
            }
        }
    }
}
