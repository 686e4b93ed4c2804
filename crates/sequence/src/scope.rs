use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use medforge_core::TenantId;

/// Identifier prefixes issued by the clinic.
pub mod prefix {
    /// Patient visit.
    pub const VISIT: &str = "VIS";
    /// Laboratory order.
    pub const LAB_ORDER: &str = "LAB";
    /// Pharmacy dispensing transaction.
    pub const DISPENSING: &str = "DSP";
    /// Consultation.
    pub const CONSULTATION: &str = "CON";
    /// Prescription.
    pub const PRESCRIPTION: &str = "RX";
}

/// The (prefix, tenant, calendar day) key space within which issued ordinals
/// must be unique and strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub prefix: String,
    pub tenant_id: TenantId,
    pub day: NaiveDate,
}

impl ScopeKey {
    pub fn new(prefix: impl Into<String>, tenant_id: TenantId, day: NaiveDate) -> Self {
        Self {
            prefix: prefix.into(),
            tenant_id,
            day,
        }
    }
}

impl core::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.prefix,
            self.tenant_id,
            self.day.format("%Y%m%d")
        )
    }
}
