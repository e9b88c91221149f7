//! Phase 2 handler: mid-tier LLM enhancement with rule-based fallback.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use mailpipe_chain::ChainError;
use mailpipe_core::analysis::{AnalysisResult, Phase2Result};
use mailpipe_core::email::Email;
use mailpipe_core::job::{Job, Phase};
use mailpipe_core::metrics::ModelTier;
use mailpipe_core::status::EmailStatus;
use mailpipe_core::OpCtx;
use mailpipe_llm::LlmError;
use mailpipe_store::{StoreError, StatusUpdate};

use crate::fallback::{phase2_fallback, FALLBACK_MODEL};
use crate::{prompts, validate, JobDisposition, WorkerDeps};

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
        Err(StoreError::NotFound(msg)) => return Err(JobDisposition::Discard { reason: msg }),
        Err(e) => return Err(retry(e)),
    };

    match email.status {
        EmailStatus::Phase1Complete | EmailStatus::Phase2Failed => {}
        // Redelivered after completion: nothing to write, but the phase 3
        // routing decision may still be pending.
        EmailStatus::Phase2Complete | EmailStatus::Phase3Complete | EmailStatus::Phase3Failed => {
            maybe_enqueue_phase3(deps, ctx, &email).await?;
            return Ok(());
        }
        EmailStatus::Pending => {
            return Err(JobDisposition::Retry {
                reason: "phase1 result not persisted yet".to_string(),
                delay: None,
            });
        }
        EmailStatus::Archived => {
            return Err(JobDisposition::Discard { reason: "email archived".to_string() });
        }
    }

    let p1 = match deps.store.get_analysis(email_id, 1).await.map_err(retry)? {
        Some((AnalysisResult::Phase1(p1), _)) => p1,
        _ => {
            return Err(JobDisposition::Retry {
                reason: "phase1 analysis missing".to_string(),
                delay: None,
            });
        }
    };

    let members = match email.chain_id {
        Some(chain_id) => deps.store.chain_member_views(chain_id).await.map_err(retry)?,
        None => Vec::new(),
    };

    let request = prompts::build_phase2_request(&email, &p1, &members);
    let started = Instant::now();

    let (result, tokens, model) = match deps
        .adapter
        .complete_json(ctx, ModelTier::MidTier, &request, &validate::phase2_validator)
        .await
    {
        Ok(outcome) => match validate::parse_phase2(&outcome.value) {
            Ok(parsed) => (parsed, outcome.tokens as i64, outcome.model),
            Err(reason) => {
                info!(email_id = %email_id, %reason, "validated response failed typed parse, using fallback");
                deps.metrics.phase_fallback(Phase::Phase2);
                (phase2_fallback(&p1), 0, FALLBACK_MODEL.to_string())
            }
        },
        Err(LlmError::ResponseShape(reason)) | Err(LlmError::Validator(reason)) => {
            info!(email_id = %email_id, %reason, "mid-tier response unusable, persisting fallback");
            deps.metrics.phase_fallback(Phase::Phase2);
            (phase2_fallback(&p1), 0, FALLBACK_MODEL.to_string())
        }
        Err(LlmError::CircuitOpen { retry_in, model }) => {
            return Err(JobDisposition::Retry {
                reason: format!("circuit open for {}", model),
                delay: Some(retry_in),
            });
        }
        Err(LlmError::Cancelled) => return Err(JobDisposition::Release),
        Err(e) => return Err(JobDisposition::Retry { reason: e.to_string(), delay: None }),
    };

    persist(deps, ctx, &email, result, tokens, &model, started.elapsed().as_millis() as i64)
        .await?;

    // Reassess the chain now that this email carries a Phase 2 result, then
    // route eligible siblings to phase 3.
    maybe_enqueue_phase3(deps, ctx, &email).await?;
    Ok(())
}

async fn persist(
    deps: &WorkerDeps,
    ctx: &OpCtx,
    email: &Email,
    result: Phase2Result,
    tokens: i64,
    model: &str,
    duration_ms: i64,
) -> Result<(), JobDisposition> {
    let confidence = result.confidence;
    deps.store
        .append_phase_result(
            email.id,
            &AnalysisResult::Phase2(result),
            confidence,
            tokens,
            model,
            duration_ms,
        )
        .await
        .map_err(retry)?;

    match deps
        .store
        .update_status(
            email.id,
            email.status,
            EmailStatus::Phase2Complete,
            StatusUpdate::default(),
        )
        .await
    {
        Ok(()) | Err(StoreError::Conflict { .. }) => {}
        Err(e) => return Err(retry(e)),
    }

    deps.metrics.phase_completed(Phase::Phase2);
    debug!(
        request_id = %ctx.request_id,
        email_id = %email.id,
        model,
        confidence,
        duration_ms,
        "phase2 complete"
    );
    Ok(())
}

/// Reassess the chain and enqueue phase 3 for members sitting at
/// `phase2_complete` once the completeness crosses the high threshold.
async fn maybe_enqueue_phase3(
    deps: &WorkerDeps,
    ctx: &OpCtx,
    email: &Email,
) -> Result<(), JobDisposition> {
    let Some(chain_id) = email.chain_id else {
        return Ok(());
    };
    let assessment = deps
        .chains
        .reassess(ctx, chain_id)
        .await
        .map_err(chain_retry)?;
    deps.metrics.chain_completeness.observe(assessment.completeness);

    if assessment.completeness >= deps.thresholds.high {
        let eligible = deps
            .store
            .chain_email_ids_with_status(chain_id, EmailStatus::Phase2Complete)
            .await
            .map_err(retry)?;
        for id in eligible {
            deps.queue
                .enqueue(Job::for_email(
                    Phase::Phase3,
                    id,
                    mailpipe_core::analysis::Priority::Medium,
                    Utc::now(),
                ))
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
