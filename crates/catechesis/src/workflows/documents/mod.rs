//! Document intake: format checks, raw storage, background extraction and
//! guardian confirmation.

pub mod domain;
pub(crate) mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use domain::{
    inspect_upload, normalize_confirmed, ConfirmRequest, Document, DocumentFormat, DocumentView,
    ExtractionStatus, UploadReceipt,
};
pub use router::document_router;
pub use service::{ConfirmOutcome, DocumentService};
