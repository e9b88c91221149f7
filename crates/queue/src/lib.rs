//! Persistent, at-least-once job queue.
//!
//! Three named streams (`phase1`, `phase2`, `phase3`) plus a dead-letter
//! stream. Jobs are leased with a visibility timeout; unacked jobs become
//! visible again, so consumers must be idempotent. The Redis backend is the
//! production implementation; the in-memory backend serves tests.

pub mod backend;
pub mod error;
pub mod memory;
pub mod queue;
pub mod redis_backend;

pub use backend::{EnqueueOutcome, QueueBackend, StreamDepth};
pub use error::QueueError;
pub use memory::InMemoryQueue;
pub use queue::{JobQueue, NackOutcome, QueueSettings};
pub use redis_backend::RedisQueue;
