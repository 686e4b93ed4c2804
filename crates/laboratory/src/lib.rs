//! Laboratory domain module (event-sourced).
//!
//! Catalog entries, the lab order aggregate and its item results. Ledger
//! consumption at sample collection is decided here (`consumable_deltas`) but
//! committed by the orchestrating service as one atomic unit. Pure domain
//! logic (no IO, no HTTP, no storage).

pub mod catalog;
pub mod order;
pub mod results;

pub use catalog::LabTest;
pub use order::{
    BillingRecordLinked, CancelOrder, CollectSample, CompleteResults, CreateLabOrder, ItemResult,
    ItemResultRecorded, LabOrder, LabOrderCancelled, LabOrderCommand, LabOrderCreated,
    LabOrderEvent, LabOrderId, LabOrderItem, LabOrderStatus, LinkBillingRecord, MarkDelivered,
    ProcessingStarted, RecordItemResult, ResultsCompleted, ResultsDelivered, ResultsVerified,
    SampleCollected, StartProcessing, VerifyResults,
};
pub use results::{AbnormalFlag, classify, parse_reference_range};
