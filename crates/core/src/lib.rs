//! restamp core library.
//!
//! This crate keeps projects generated from a template in step with later
//! versions of that template: answers and provenance persistence, template
//! history queries, snapshot rendering, three-tree reconciliation with
//! conflict reporting, and the update workflow tying them together.

pub mod answers;
pub mod config;
pub mod conflict;
pub mod dirty;
pub mod errors;
mod fsutil;
pub mod generate;
pub mod history;
pub mod models;
pub mod outdated;
pub mod reconcile;
pub mod snapshot;
pub mod update;
pub mod vcs;

#[cfg(test)]
mod test_support;

// Re-exports for convenience.
pub use answers::AnswersStore;
pub use config::RestampConfig;
pub use errors::CoreError;
pub use generate::{GenerateRequest, ProjectGenerator};
pub use models::{AnswerSet, Provenance, UpdateResult, UpdateStatus};
pub use outdated::{OutdatedChecker, OutdatedReport, OutdatedStatus};
pub use reconcile::ReconciliationEngine;
pub use update::{UpdateOrchestrator, UpdateRequest};
