//! Phase-specific worker pools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mailpipe_core::job::{Job, Phase};
use mailpipe_core::metrics::ModelTier;
use mailpipe_core::status::EmailStatus;
use mailpipe_core::OpCtx;
use mailpipe_queue::NackOutcome;
use mailpipe_store::{StoreError, StatusUpdate};

use crate::{phase1, phase2, phase3, JobDisposition, WorkerDeps};

/// Pause between breaker probes while a phase's model circuit is open.
const BREAKER_PAUSE: Duration = Duration::from_secs(1);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    drain_window: Duration,
}

impl WorkerPool {
    /// Spawn all phase pools. `cancel` is the shutdown root; each worker
    /// gets a child token.
    pub fn spawn(deps: Arc<WorkerDeps>, cancel: CancellationToken) -> Self {
        let drain_window = Duration::from_secs(deps.workers.drain_window_secs);
        let mut handles = Vec::new();
        for (phase, count) in [
            (Phase::Phase1, deps.workers.phase1),
            (Phase::Phase2, deps.workers.phase2),
            (Phase::Phase3, deps.workers.phase3),
        ] {
            for index in 0..count {
                let deps = deps.clone();
                let token = cancel.child_token();
                handles.push(tokio::spawn(async move {
                    worker_loop(deps, phase, index, token).await;
                }));
            }
        }
        info!(total = handles.len(), "worker pools started");
        Self { handles, cancel, drain_window }
    }

    /// Graceful shutdown: stop accepting new jobs, let in-flight jobs finish
    /// within the drain window, then abort stragglers (their leases expire
    /// and the queue redelivers).
    pub async fn shutdown(self) {
        info!(drain_window_secs = self.drain_window.as_secs(), "draining worker pools");
        self.cancel.cancel();
        let all = futures::future::join_all(self.handles);
        if tokio::time::timeout(self.drain_window, all).await.is_err() {
            warn!("drain window elapsed with jobs still in flight");
        }
        info!("worker pools stopped");
    }
}

async fn worker_loop(deps: Arc<WorkerDeps>, phase: Phase, index: u32, cancel: CancellationToken) {
    deps.metrics.worker_started(phase);
    debug!(phase = %phase, index, "worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // While this phase's model circuit is open, the workers pause; they
        // do not drain the stream. Phase 1 has no model dependency.
        if let Some(tier) = tier_for(phase) {
            if deps.adapter.circuit_open(tier) {
                deps.metrics
                    .set_breaker_state(tier, deps.adapter.breaker_gauge(tier));
                if sleep_or_cancel(&cancel, BREAKER_PAUSE).await {
                    break;
                }
                continue;
            }
        }

        // Backpressure: slow down when the downstream stream is backed up.
        if let Some(delay) = backpressure_delay(&deps, phase) {
            if sleep_or_cancel(&cancel, delay).await {
                break;
            }
            continue;
        }

        let leased = tokio::select! {
            _ = cancel.cancelled() => break,
            leased = deps.queue.lease(phase) => leased,
        };

        match leased {
            Ok(Some(job)) => {
                process(&deps, phase, job, &cancel).await;
            }
            Ok(None) => {
                if sleep_or_cancel(&cancel, Duration::from_millis(deps.workers.poll_interval_ms))
                    .await
                {
                    break;
                }
            }
            Err(e) => {
                warn!(phase = %phase, error = %e, "lease failed");
                if sleep_or_cancel(&cancel, ERROR_PAUSE).await {
                    break;
                }
            }
        }
    }

    deps.metrics.worker_stopped(phase);
    debug!(phase = %phase, index, "worker stopped");
}

async fn process(deps: &Arc<WorkerDeps>, phase: Phase, job: Job, cancel: &CancellationToken) {
    let ctx = OpCtx::with_cancel(cancel.child_token());
    let budget = phase_budget(deps, phase);
    let started = Instant::now();

    let disposition = match tokio::time::timeout(budget, run_handler(deps, &ctx, phase, &job)).await
    {
        Ok(d) => d,
        Err(_) => JobDisposition::Retry {
            reason: format!("Timeout: phase budget {:?} exceeded", budget),
            delay: None,
        },
    };

    match disposition {
        JobDisposition::Done => {
            deps.metrics.phase_duration(phase, started.elapsed());
            if let Err(e) = deps.queue.ack(&job).await {
                // The lease will expire and the job redelivers; consumers
                // are idempotent, so this only costs a redundant run.
                error!(job_id = %job.job_id, error = %e, "ack failed");
            }
        }
        JobDisposition::Discard { reason } => {
            warn!(job_id = %job.job_id, phase = %phase, reason, "discarding job");
            if let Err(e) = deps.queue.ack(&job).await {
                error!(job_id = %job.job_id, error = %e, "ack failed");
            }
        }
        JobDisposition::Release => {
            debug!(job_id = %job.job_id, "releasing lease on cancellation");
            if let Err(e) = deps.queue.release(&job).await {
                error!(job_id = %job.job_id, error = %e, "release failed");
            }
        }
        JobDisposition::Retry { reason, delay } => {
            deps.metrics.phase_failed(phase);
            match deps.queue.nack_after(&job, &reason, delay).await {
                Ok(NackOutcome::Retried { attempts }) => {
                    debug!(job_id = %job.job_id, attempts, reason, "job nacked for retry");
                }
                Ok(NackOutcome::DeadLettered) => {
                    mark_emails_failed(deps, phase, &job, &reason).await;
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "nack failed");
                }
            }
        }
    }
}

async fn run_handler(
    deps: &Arc<WorkerDeps>,
    ctx: &OpCtx,
    phase: Phase,
    job: &Job,
) -> JobDisposition {
    match phase {
        Phase::Phase1 => phase1::run(deps, ctx, job).await,
        Phase::Phase2 => phase2::run(deps, ctx, job).await,
        Phase::Phase3 => phase3::run(deps, ctx, job).await,
    }
}

/// A dead-lettered LLM job leaves its emails in a failed status so the
/// dashboard escalates them and the backfill path can retry.
async fn mark_emails_failed(deps: &Arc<WorkerDeps>, phase: Phase, job: &Job, reason: &str) {
    let (from, to) = match phase {
        Phase::Phase2 => (EmailStatus::Phase1Complete, EmailStatus::Phase2Failed),
        Phase::Phase3 => (EmailStatus::Phase2Complete, EmailStatus::Phase3Failed),
        // The rule engine has no failure status; the email stays pending
        // for the next backfill sweep.
        Phase::Phase1 => return,
    };
    for email_id in &job.email_ids {
        let update = StatusUpdate {
            error_message: Some(format!("{}: {}", phase, reason)),
        };
        match deps.store.update_status(*email_id, from, to, update).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {}
            Err(e) => {
                error!(email_id = %email_id, error = %e, "failed to record phase failure");
            }
        }
    }
}

fn tier_for(phase: Phase) -> Option<ModelTier> {
    match phase {
        Phase::Phase1 => None,
        Phase::Phase2 => Some(ModelTier::MidTier),
        Phase::Phase3 => Some(ModelTier::HighTier),
    }
}

fn phase_budget(deps: &WorkerDeps, phase: Phase) -> Duration {
    Duration::from_secs(match phase {
        Phase::Phase1 => deps.workers.phase1_budget_secs,
        Phase::Phase2 => deps.workers.phase2_budget_secs,
        Phase::Phase3 => deps.workers.phase3_budget_secs,
    })
}

/// Sleep proportional to how far the downstream stream is past its
/// high-water mark. Returns None when there is no pressure.
fn backpressure_delay(deps: &WorkerDeps, phase: Phase) -> Option<Duration> {
    let next = phase.next()?;
    let depth = deps.metrics.queue_depth(next);
    let hwm = deps.queue_cfg.high_water_mark;
    if depth <= hwm {
        return None;
    }
    let excess = depth - hwm;
    let ms = (excess.saturating_mul(1000) / hwm.max(1)).clamp(250, 5_000);
    Some(Duration::from_millis(ms))
}

/// Returns true when cancelled during the sleep.
async fn sleep_or_cancel(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

/// Periodic queue upkeep: lease recovery, delayed promotion, priority aging,
/// and depth gauges. Runs until cancelled.
pub async fn maintenance_loop(
    queue: Arc<mailpipe_queue::JobQueue>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "queue maintenance loop started");
    loop {
        for stream in Phase::ALL {
            if let Err(e) = queue.maintain(stream).await {
                warn!(stream = %stream, error = %e, "queue maintenance failed");
            }
        }
        if sleep_or_cancel(&cancel, interval).await {
            break;
        }
    }
    info!("queue maintenance loop stopped");
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_map_to_llm_phases_only() {
        assert_eq!(tier_for(Phase::Phase1), None);
        assert_eq!(tier_for(Phase::Phase2), Some(ModelTier::MidTier));
        assert_eq!(tier_for(Phase::Phase3), Some(ModelTier::HighTier));
    }

    #[tokio::test]
    async fn sleep_or_cancel_returns_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(60)).await);
    }
}
