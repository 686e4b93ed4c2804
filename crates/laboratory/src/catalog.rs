//! Laboratory test catalog entries.

use serde::{Deserialize, Serialize};

use medforge_core::{DomainError, DomainResult};
use medforge_inventory::ProductId;

/// A catalog entry for an orderable laboratory test.
///
/// Orders embed a snapshot of the entry so later catalog edits never change
/// what was ordered or billed. `consumable` links the stockable product (e.g.
/// a collection tube) drawn down when the sample is collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabTest {
    pub code: String,
    pub name: String,
    /// Price in smallest currency unit (e.g., cents).
    pub price: u64,
    pub consumable: Option<ProductId>,
}

impl LabTest {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        price: u64,
        consumable: Option<ProductId>,
    ) -> DomainResult<Self> {
        let code = code.into();
        let name = name.into();
        if code.trim().is_empty() {
            return Err(DomainError::validation("test code cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("test name cannot be empty"));
        }
        Ok(Self {
            code,
            name,
            price,
            consumable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_code() {
        let err = LabTest::new("  ", "Complete Blood Count", 1500, None).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn carries_optional_consumable_link() {
        let test = LabTest::new("CBC", "Complete Blood Count", 1500, None).unwrap();
        assert!(test.consumable.is_none());
    }
}
