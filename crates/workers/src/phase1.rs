//! Phase 1 handler: rule-based triage plus chain bookkeeping.

use std::time::Instant;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use mailpipe_chain::ChainError;
use mailpipe_core::analysis::AnalysisResult;
use mailpipe_core::job::{Job, Phase};
use mailpipe_core::status::EmailStatus;
use mailpipe_core::OpCtx;
use mailpipe_store::{StoreError, StatusUpdate};

use crate::{JobDisposition, WorkerDeps};

const RULES_MODEL: &str = "rules";

pub async fn run(deps: &WorkerDeps, ctx: &OpCtx, job: &Job) -> JobDisposition {
    for email_id in &job.email_ids {
        if let Err(disposition) = run_one(deps, ctx, *email_id).await {
            return disposition;
        }
    }
    JobDisposition::Done
}

async fn run_one(deps: &WorkerDeps, ctx: &OpCtx, email_id: Uuid) -> Result<(), JobDisposition> {
    let email = match deps.store.get_email(email_id).await {
        Ok(email) => email,
        Err(StoreError::NotFound(msg)) => {
            return Err(JobDisposition::Discard { reason: msg });
        }
        Err(e) => return Err(retry(e)),
    };
    if ctx.is_cancelled() {
        return Err(JobDisposition::Release);
    }

    let p1 = if email.status == EmailStatus::Pending {
        let started = Instant::now();
        let result = deps
            .rules
            .analyze(&email.subject, &email.body_text, &email.sender_address);
        let duration_ms = started.elapsed().as_millis() as i64;

        deps.store
            .append_phase_result(
                email_id,
                &AnalysisResult::Phase1(result.clone()),
                result.confidence,
                0,
                RULES_MODEL,
                duration_ms,
            )
            .await
            .map_err(retry)?;

        match deps
            .store
            .update_status(
                email_id,
                EmailStatus::Pending,
                EmailStatus::Phase1Complete,
                StatusUpdate::default(),
            )
            .await
        {
            // A concurrent delivery already advanced the row; the result
            // write above was idempotent, so this is a benign replay.
            Ok(()) | Err(StoreError::Conflict { .. }) => {}
            Err(e) => return Err(retry(e)),
        }

        deps.metrics.phase_completed(Phase::Phase1);
        debug!(
            request_id = %ctx.request_id,
            email_id = %email_id,
            category = %result.workflow_category,
            priority = %result.priority,
            "phase1 complete"
        );
        result
    } else {
        match deps.store.get_analysis(email_id, 1).await.map_err(retry)? {
            Some((AnalysisResult::Phase1(stored), _)) => stored,
            // The email advanced without a stored Phase 1 row; recompute
            // just for the routing decision below.
            _ => deps
                .rules
                .analyze(&email.subject, &email.body_text, &email.sender_address),
        }
    };

    let (chain_id, assessment) = match email.chain_id {
        Some(chain_id) => {
            let assessment = deps
                .chains
                .reassess(ctx, chain_id)
                .await
                .map_err(chain_retry)?;
            (chain_id, assessment)
        }
        None => deps
            .chains
            .assign(
                ctx,
                email_id,
                email.conversation_id.as_deref(),
                &email.subject,
                &email.sender_address,
            )
            .await
            .map_err(chain_retry)?,
    };
    deps.metrics.chain_completeness.observe(assessment.completeness);

    // Adaptive routing: the chain's completeness decides whether this email
    // (and any siblings parked at phase1) go deeper.
    if assessment.completeness >= deps.thresholds.mid {
        let eligible = deps
            .store
            .chain_email_ids_with_status(chain_id, EmailStatus::Phase1Complete)
            .await
            .map_err(retry)?;
        for id in eligible {
            deps.queue
                .enqueue(Job::for_email(Phase::Phase2, id, p1.priority, Utc::now()))
                .await
                .map_err(|e| JobDisposition::Retry { reason: e.to_string(), delay: None })?;
        }
    }

    Ok(())
}

fn retry(e: StoreError) -> JobDisposition {
    JobDisposition::Retry { reason: e.to_string(), delay: None }
}

fn chain_retry(e: ChainError) -> JobDisposition {
    match e {
        ChainError::Cancelled => JobDisposition::Release,
        other => JobDisposition::Retry { reason: other.to_string(), delay: None },
    }
}
