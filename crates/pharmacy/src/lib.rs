//! Pharmacy dispensing domain module (event-sourced).
//!
//! The dispensing aggregate decrements stock optimistically at item creation
//! and is the reference workflow for ledger reversal on cancellation. The
//! coupling with the inventory ledger is committed by the orchestrating
//! service as one atomic unit. Pure domain logic (no IO, no HTTP, no storage).

pub mod dispensing;

pub use dispensing::{
    AddItem, BillingRecordLinked, CancelDispensing, CompleteDispensing, CreateDispensing,
    DispensingCancelled, DispensingCommand, DispensingCompleted, DispensingCreated,
    DispensingEvent, DispensingId, DispensingItem, DispensingStatus, ItemAdded, LinkBillingRecord,
    MarkPartial, MarkedPartial, PharmacyDispensing,
};
