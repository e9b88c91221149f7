//! Phase 1 rule engine: deterministic, single-email triage.
//!
//! Pure CPU work with no I/O and no model calls. Classifies the workflow, derives a
//! priority, extracts entities with character spans, and emits the boolean
//! signal flags the chain analyzer rolls up.

pub mod engine;
pub mod entities;
pub mod patterns;

pub use engine::{RuleEngine, RulesConfig};

/// Bumped whenever a pattern table changes so downstream analytics can
/// filter results by extraction vintage.
pub const RULES_VERSION: &str = "2025.06.1";
