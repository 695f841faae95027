//! Payment submission, the treasurer review queue and validation.

pub mod domain;
pub(crate) mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use domain::{
    AdvisoryProof, NewPayment, Payment, PaymentMethod, PaymentReceipt, PaymentStatus, QueueEntry,
    QueueFilter, RejectRequest, ReviewOutcome, ValidateRequest,
};
pub use router::payment_router;
pub use service::PaymentService;
