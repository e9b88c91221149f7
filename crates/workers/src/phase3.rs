//! Phase 3 handler: high-tier strategic analysis.
//!
//! Runs only for emails whose chain crossed the high completeness threshold
//! (or via the operator reprocess path). There is no rule-derived fallback
//! at this depth: an unusable response marks the email `phase3_failed`,
//! which the reprocess path can later clear.

use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use mailpipe_core::analysis::AnalysisResult;
use mailpipe_core::job::{Job, Phase};
use mailpipe_core::metrics::ModelTier;
use mailpipe_core::status::EmailStatus;
use mailpipe_core::OpCtx;
use mailpipe_llm::LlmError;
use mailpipe_store::{StoreError, StatusUpdate};

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
        EmailStatus::Phase2Complete | EmailStatus::Phase3Failed => {}
        EmailStatus::Phase3Complete => return Ok(()),
        EmailStatus::Pending | EmailStatus::Phase1Complete | EmailStatus::Phase2Failed => {
            return Err(JobDisposition::Retry {
                reason: "phase2 not complete yet".to_string(),
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
    let p2 = match deps.store.get_analysis(email_id, 2).await.map_err(retry)? {
        Some((AnalysisResult::Phase2(p2), _)) => p2,
        _ => {
            return Err(JobDisposition::Retry {
                reason: "phase2 analysis missing".to_string(),
                delay: None,
            });
        }
    };

    let members = match email.chain_id {
        Some(chain_id) => deps.store.chain_member_views(chain_id).await.map_err(retry)?,
        None => Vec::new(),
    };

    let request = prompts::build_phase3_request(&email, &p1, &p2, &members);
    let started = Instant::now();

    match deps
        .adapter
        .complete_json(ctx, ModelTier::HighTier, &request, &validate::phase3_validator)
        .await
    {
        Ok(outcome) => {
            let parsed = match validate::parse_phase3(&outcome.value) {
                Ok(parsed) => parsed,
                Err(reason) => return mark_failed(deps, &email, &reason).await,
            };
            let confidence = parsed.confidence;
            deps.store
                .append_phase_result(
                    email_id,
                    &AnalysisResult::Phase3(parsed),
                    confidence,
                    outcome.tokens as i64,
                    &outcome.model,
                    started.elapsed().as_millis() as i64,
                )
                .await
                .map_err(retry)?;

            match deps
                .store
                .update_status(
                    email_id,
                    email.status,
                    EmailStatus::Phase3Complete,
                    StatusUpdate::default(),
                )
                .await
            {
                Ok(()) | Err(StoreError::Conflict { .. }) => {}
                Err(e) => return Err(retry(e)),
            }

            deps.metrics.phase_completed(Phase::Phase3);
            if let Some(chain_id) = email.chain_id {
                deps.chains.invalidate(chain_id);
            }
            debug!(
                request_id = %ctx.request_id,
                email_id = %email_id,
                model = %outcome.model,
                confidence,
                "phase3 complete"
            );
            Ok(())
        }
        Err(LlmError::ResponseShape(reason)) | Err(LlmError::Validator(reason)) => {
            mark_failed(deps, &email, &reason).await
        }
        Err(LlmError::CircuitOpen { retry_in, model }) => Err(JobDisposition::Retry {
            reason: format!("circuit open for {}", model),
            delay: Some(retry_in),
        }),
        Err(LlmError::Cancelled) => Err(JobDisposition::Release),
        Err(e) => Err(JobDisposition::Retry { reason: e.to_string(), delay: None }),
    }
}

/// Unusable model output after the strict retry: record the failure so the
/// dashboard escalates it, and finish the job.
async fn mark_failed(
    deps: &WorkerDeps,
    email: &mailpipe_core::email::Email,
    reason: &str,
) -> Result<(), JobDisposition> {
    warn!(email_id = %email.id, reason, "phase3 response unusable, marking failed");
    deps.metrics.phase_failed(Phase::Phase3);
    if email.status == EmailStatus::Phase3Failed {
        return Ok(());
    }
    match deps
        .store
        .update_status(
            email.id,
            email.status,
            EmailStatus::Phase3Failed,
            StatusUpdate { error_message: Some(format!("phase3: {}", reason)) },
        )
        .await
    {
        Ok(()) | Err(StoreError::Conflict { .. }) => Ok(()),
        Err(e) => Err(retry(e)),
    }
}

fn retry(e: StoreError) -> JobDisposition {
    JobDisposition::Retry { reason: e.to_string(), delay: None }
}
