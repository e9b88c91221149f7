//! Queue backend trait and shared types.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use mailpipe_core::job::{Job, Phase};

use crate::error::QueueError;

/// Dequeue ordering rank stride: ready score = rank * STRIDE + enqueued_ms.
/// Epoch milliseconds stay below the stride for the next ~250 years, so the
/// composite sorts by (priority, enqueued_at).
pub const RANK_STRIDE: i64 = 10_000_000_000_000;

/// Compute the ready-ordering score for a job.
pub fn ready_score(rank: u8, enqueued_ms: i64) -> i64 {
    rank as i64 * RANK_STRIDE + enqueued_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Same idempotency key seen within the dedup window; nothing enqueued.
    Deduplicated,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamDepth {
    pub ready: u64,
    pub delayed: u64,
    pub leased: u64,
}

impl StreamDepth {
    pub fn total(&self) -> u64 {
        self.ready + self.delayed + self.leased
    }
}

/// Storage primitives behind the [`crate::JobQueue`] policy layer.
///
/// Implementations must survive process restarts (except the in-memory test
/// backend) and must never lose an acknowledged job.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert a job unless its idempotency key was seen within `idem_ttl`.
    async fn enqueue(&self, job: &Job, idem_ttl: Duration) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the next visible job, ordered by (priority, not_before,
    /// enqueued_at). Returns None when the stream is empty or paused.
    async fn lease(&self, stream: Phase, visibility: Duration) -> Result<Option<Job>, QueueError>;

    /// Remove a completed job. Idempotent.
    async fn ack(&self, stream: Phase, job_id: &str) -> Result<(), QueueError>;

    /// Re-queue a failed job as delayed; `job` carries the bumped attempt
    /// count, error, and `not_before`.
    async fn retry(&self, job: &Job) -> Result<(), QueueError>;

    /// Move a job to the dead-letter stream with its full context.
    async fn dead_letter(&self, job: &Job) -> Result<(), QueueError>;

    /// Move due delayed jobs into the ready set. Returns how many moved.
    async fn promote_due(&self, stream: Phase) -> Result<u64, QueueError>;

    /// Make expired leases visible again. Returns how many were recovered.
    async fn recover_expired(&self, stream: Phase) -> Result<u64, QueueError>;

    /// Promote ready jobs that waited past `threshold` one priority level.
    /// Returns how many were promoted.
    async fn promote_aged(&self, stream: Phase, threshold: Duration) -> Result<u64, QueueError>;

    async fn depth(&self, stream: Phase) -> Result<StreamDepth, QueueError>;

    async fn dls_depth(&self) -> Result<u64, QueueError>;

    async fn dls_peek(&self, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Move up to `limit` dead-lettered jobs back to their streams with a
    /// reset attempt count, bypassing idempotency. Returns how many moved.
    async fn dls_requeue(&self, limit: usize) -> Result<u64, QueueError>;

    async fn peek(&self, stream: Phase, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Drop all ready and delayed jobs in a stream (leased jobs finish).
    async fn drain(&self, stream: Phase) -> Result<u64, QueueError>;

    async fn set_paused(&self, stream: Phase, paused: bool) -> Result<(), QueueError>;

    async fn is_paused(&self, stream: Phase) -> Result<bool, QueueError>;

    /// Reachability probe for health checks.
    async fn ping(&self) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_score_orders_priority_before_age() {
        let old_low = ready_score(4, 1_000);
        let new_critical = ready_score(1, 2_000_000);
        assert!(new_critical < old_low);
    }

    #[test]
    fn ready_score_orders_age_within_priority() {
        assert!(ready_score(2, 1_000) < ready_score(2, 2_000));
    }
}
