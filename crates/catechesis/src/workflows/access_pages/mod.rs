//! Temporary access pages kept in their own store.

pub mod domain;
pub(crate) mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use domain::{AccessPage, AccessPageView, AccessPurpose, IssueRequest, PageSummary};
pub use router::access_page_router;
pub use service::AccessPageService;
