//! The persistent store: emails, chains, recipients, analyses.
//!
//! PostgreSQL via sqlx. All status transitions are validated against the
//! state machine and applied with optimistic concurrency; phase results are
//! unique per (email, phase) so redelivered jobs cannot double-write.

pub mod error;
pub mod rows;
pub mod store;

pub use error::StoreError;
pub use store::{AnalysisRow, EmailRecord, Store, StatusUpdate, UpsertOutcome};
