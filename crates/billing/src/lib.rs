//! `medforge-billing` — the surface of the external billing collaborator.
//!
//! Request/line-item shapes and the gateway trait the synthesis step calls.
//! The collaborator itself (invoice storage, payment tracking) is out of
//! scope; only what the core sends and receives is modeled here.

pub mod gateway;
pub mod record;

pub use gateway::{BillingGateway, BillingGatewayError, InMemoryBillingGateway};
pub use record::{BillingLineItem, BillingRecordId, BillingRequest};
