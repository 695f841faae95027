//! Enrollment lifecycle: intake with duplicate detection, the status machine,
//! number issuance, guardian links and classes.

pub mod domain;
pub mod lifecycle;
pub mod machine;
pub(crate) mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use domain::{
    normalize_name, Class, DocumentSummary, Enrollment, EnrollmentStatus, EnrollmentView,
    LinkRequest, NewClass, NewEnrollment, Prefill, PrefillQuery,
};
pub use lifecycle::{derive_status, Balance, DocumentRequirements};
pub use machine::{reevaluate, Transition};
pub use router::enrollment_router;
pub use service::EnrollmentService;
