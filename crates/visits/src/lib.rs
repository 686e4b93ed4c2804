//! Patient visit domain module (event-sourced).
//!
//! The outer coordinating state machine: tracks which clinical sub-workflow
//! currently owns the patient. Routing only; the visit never touches the
//! inventory ledger. Pure domain logic (no IO, no HTTP, no storage).

pub mod visit;

pub use visit::{
    CancelVisit, CompleteVisit, MarkNoShow, PatientVisit, PatientVisitId, RegisterVisit,
    RouteVisit, VisitCancelled, VisitCommand, VisitCompleted, VisitEvent, VisitNoShow,
    VisitRegistered, VisitRoute, VisitRouted, VisitStatus,
};
