//! Enrollment intake and payment-validation pipeline for parish catechism
//! programs.
//!
//! Guardians submit identity and sacramental documents plus payment proofs.
//! Extraction pre-fills what it can read and the guardian confirms it; a
//! treasurer reviews each payment. The enrollment state machine derives every
//! status change from those facts. Enrollment data lives apart from the
//! temporary access pages and from the system registry, each in its own
//! SQLite store.

pub mod access;
pub mod config;
pub mod error;
pub mod extraction;
pub mod ids;
pub mod objects;
pub mod stores;
pub mod sweeps;
pub mod telemetry;
pub mod workflows;

pub use error::{AppError, PipelineError};
