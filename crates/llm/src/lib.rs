//! Uniform client to the local LLM runtime.
//!
//! Two named model tiers (`mid_tier`, `high_tier`), each with its own
//! timeout, semaphore, rate bucket, and circuit breaker. Responses pass
//! through a JSON salvage chain and a caller-supplied quality gate before
//! they reach the analyzers.

pub mod adapter;
pub mod breaker;
pub mod cache;
pub mod error;
pub mod limiter;
pub mod provider;
pub mod providers;
pub mod salvage;

pub use adapter::{JsonOutcome, JsonRequest, LlmAdapter, LlmOutcome, Validator};
pub use breaker::CircuitBreaker;
pub use error::LlmError;
pub use provider::{Completion, CompletionParams, LlmProvider, Message, Role};
