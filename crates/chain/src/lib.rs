//! Conversation chain analysis.
//!
//! Groups related emails into chains, scores chain completeness, and derives
//! the recommended analysis depth. Scoring is deterministic for a given
//! ordered history; the analyzer is idempotent under replay.

pub mod analyzer;
pub mod scoring;

pub use analyzer::{ChainAnalyzer, ChainError, ChainStore};
pub use scoring::{assess, grouping_key, normalize_subject, ChainAssessment, ChainMemberView};
