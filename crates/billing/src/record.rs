//! Billing record request types.
//!
//! The billing collaborator is external; this module only shapes what the core
//! sends it. Totals are always recomputed from line items, never copied from a
//! cached figure.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use medforge_core::{DomainError, DomainResult, PatientId, TenantId, ValueObject};

/// Identifier of a billing record owned by the external collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingRecordId(Uuid);

impl BillingRecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BillingRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BillingRecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for BillingRecordId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("BillingRecordId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// One billable line, mapped 1:1 from a workflow item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingLineItem {
    pub description: String,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
}

impl BillingLineItem {
    pub fn line_total(&self) -> DomainResult<u64> {
        let total = (self.quantity as i128)
            .checked_mul(self.unit_price as i128)
            .ok_or_else(|| DomainError::validation("billing line amount overflow"))?;
        u64::try_from(total).map_err(|_| DomainError::validation("billing line total out of range"))
    }
}

impl ValueObject for BillingLineItem {}

/// A request for the external billing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRequest {
    pub tenant_id: TenantId,
    pub payer: PatientId,
    pub title: String,
    pub due_date: DateTime<Utc>,
    pub line_items: Vec<BillingLineItem>,
}

impl BillingRequest {
    pub fn new(
        tenant_id: TenantId,
        payer: PatientId,
        title: impl Into<String>,
        due_date: DateTime<Utc>,
        line_items: Vec<BillingLineItem>,
    ) -> DomainResult<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::validation("billing title cannot be empty"));
        }
        if line_items.is_empty() {
            return Err(DomainError::validation(
                "cannot request a billing record without line items",
            ));
        }
        for line in &line_items {
            if line.description.trim().is_empty() {
                return Err(DomainError::validation(
                    "billing line description cannot be empty",
                ));
            }
            if line.quantity <= 0 {
                return Err(DomainError::validation(
                    "billing line quantity must be positive",
                ));
            }
        }

        Ok(Self {
            tenant_id,
            payer,
            title,
            due_date,
            line_items,
        })
    }

    /// Total recomputed from line items.
    pub fn total_amount(&self) -> DomainResult<u64> {
        let mut total: u64 = 0;
        for line in &self.line_items {
            total = total
                .checked_add(line.line_total()?)
                .ok_or_else(|| DomainError::validation("billing total overflow"))?;
        }
        Ok(total)
    }
}
