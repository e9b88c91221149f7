//! Worker pools and the Phase 1/2/3 job handlers.
//!
//! One pool per phase, sized independently. Phase ordering is enforced by
//! the enqueue sequence: each phase enqueues the next on success, never by
//! cross-worker locks. Workers honor cooperative cancellation and pause
//! while their model tier's circuit is open.

pub mod fallback;
pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod pool;
pub mod prompts;
pub mod validate;

use std::sync::Arc;

use mailpipe_chain::ChainAnalyzer;
use mailpipe_core::config::{QueueConfig, ThresholdConfig, WorkerConfig};
use mailpipe_core::metrics::MetricsHub;
use mailpipe_llm::LlmAdapter;
use mailpipe_queue::JobQueue;
use mailpipe_rules::RuleEngine;
use mailpipe_store::Store;

pub use pool::WorkerPool;

/// Everything a worker needs, injected once at startup.
pub struct WorkerDeps {
    pub store: Arc<Store>,
    pub queue: Arc<JobQueue>,
    pub chains: Arc<ChainAnalyzer>,
    pub adapter: Arc<LlmAdapter>,
    pub rules: Arc<RuleEngine>,
    pub metrics: Arc<MetricsHub>,
    pub workers: WorkerConfig,
    pub thresholds: ThresholdConfig,
    pub queue_cfg: QueueConfig,
}

/// What the pool should do with the job after a handler run.
#[derive(Debug)]
pub enum JobDisposition {
    /// Effects persisted; ack.
    Done,
    /// Not processable and never will be (missing email, stale job); ack
    /// and log rather than burn retries.
    Discard { reason: String },
    /// Transient failure; nack with backoff (or an explicit delay when the
    /// breaker reports its remaining cooldown).
    Retry { reason: String, delay: Option<std::time::Duration> },
    /// Cancelled mid-flight (shutdown). Release the lease without an
    /// attempt penalty; nothing was persisted.
    Release,
}
