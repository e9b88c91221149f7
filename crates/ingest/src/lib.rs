//! Normalizing intake: batch JSON loads and incremental webhook pushes both
//! reduce to "create-or-update an email". Accepted emails land `pending`,
//! get a chain assignment, and enqueue a `phase1` job. Duplicate ingest is
//! silent and enqueues nothing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use mailpipe_chain::{ChainAnalyzer, ChainError};
use mailpipe_core::analysis::Priority;
use mailpipe_core::email::{Importance, NormalizedEmail};
use mailpipe_core::job::{Job, Phase};
use mailpipe_core::metrics::MetricsHub;
use mailpipe_core::OpCtx;
use mailpipe_queue::{JobQueue, QueueError};
use mailpipe_store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => IngestError::StoreUnavailable(msg),
            other => IngestError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for IngestError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Connection(msg) => IngestError::QueueUnavailable(msg),
            other => IngestError::Internal(other.to_string()),
        }
    }
}

impl From<ChainError> for IngestError {
    fn from(e: ChainError) -> Self {
        IngestError::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted(Uuid),
    Duplicate(Uuid),
}

impl IngestOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            IngestOutcome::Accepted(id) | IngestOutcome::Duplicate(id) => *id,
        }
    }
}

/// Per-item result for batch imports.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub internet_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct IngestPort {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    chains: Arc<ChainAnalyzer>,
    metrics: Arc<MetricsHub>,
}

impl IngestPort {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        chains: Arc<ChainAnalyzer>,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self { store, queue, chains, metrics }
    }

    /// Ingest a single normalized record. `priority_hint` comes from the
    /// incremental push path.
    pub async fn ingest_one(
        &self,
        ctx: &OpCtx,
        record: &NormalizedEmail,
        priority_hint: Option<Priority>,
    ) -> Result<IngestOutcome, IngestError> {
        if let Err(reason) = validate(record) {
            self.metrics.ingest_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::Input(reason));
        }

        let outcome = self.store.upsert_email(record).await?;
        let id = outcome.id();

        if !outcome.is_new() {
            self.metrics.ingest_duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(
                request_id = %ctx.request_id,
                email_id = %id,
                message_id = %record.internet_message_id,
                "duplicate ingest ignored"
            );
            return Ok(IngestOutcome::Duplicate(id));
        }

        self.metrics.emails_ingested.fetch_add(1, Ordering::Relaxed);

        let (_, assessment) = self
            .chains
            .assign(
                ctx,
                id,
                record.conversation_id.as_deref(),
                &record.subject,
                &record.sender.address,
            )
            .await?;
        self.metrics.chain_completeness.observe(assessment.completeness);

        let priority =
            priority_hint.unwrap_or_else(|| initial_priority(record.importance, assessment.recommended_phase));
        self.queue
            .enqueue(Job::for_email(Phase::Phase1, id, priority, chrono::Utc::now()))
            .await?;

        debug!(
            request_id = %ctx.request_id,
            email_id = %id,
            priority = %priority,
            completeness = assessment.completeness,
            "email accepted"
        );
        Ok(IngestOutcome::Accepted(id))
    }

    /// Batch import: each record is processed independently; one bad record
    /// does not fail the batch.
    pub async fn ingest_batch(
        &self,
        ctx: &OpCtx,
        records: &[NormalizedEmail],
    ) -> Vec<BatchItemResult> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let item = match self.ingest_one(ctx, record, None).await {
                Ok(IngestOutcome::Accepted(id)) => BatchItemResult {
                    internet_message_id: record.internet_message_id.clone(),
                    id: Some(id),
                    status: "pending",
                    error: None,
                },
                Ok(IngestOutcome::Duplicate(id)) => BatchItemResult {
                    internet_message_id: record.internet_message_id.clone(),
                    id: Some(id),
                    status: "duplicate",
                    error: None,
                },
                Err(e) => BatchItemResult {
                    internet_message_id: record.internet_message_id.clone(),
                    id: None,
                    status: "rejected",
                    error: Some(e.to_string()),
                },
            };
            results.push(item);
        }
        let accepted = results.iter().filter(|r| r.status == "pending").count();
        info!(
            request_id = %ctx.request_id,
            total = records.len(),
            accepted,
            "batch ingest finished"
        );
        results
    }
}

/// Wire-shape validation beyond what serde enforces.
pub fn validate(record: &NormalizedEmail) -> Result<(), String> {
    if record.internet_message_id.trim().is_empty() {
        return Err("internet_message_id is required".to_string());
    }
    if record.internet_message_id.len() > 998 {
        return Err("internet_message_id exceeds 998 characters".to_string());
    }
    if !record.sender.address.is_empty() && !record.sender.address.contains('@') {
        return Err(format!(
            "sender address '{}' is not an email address",
            record.sender.address
        ));
    }
    Ok(())
}

/// Initial job priority: the chain's recommended phase is the proxy, so
/// chains with prior analysis depth get serviced sooner. Importance flags
/// from the source override.
pub fn initial_priority(importance: Option<Importance>, recommended: Phase) -> Priority {
    match importance {
        Some(Importance::High) => return Priority::High,
        Some(Importance::Low) => return Priority::Low,
        _ => {}
    }
    match recommended {
        Phase::Phase3 => Priority::High,
        Phase::Phase2 => Priority::Medium,
        Phase::Phase1 => Priority::Medium,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mailpipe_core::email::Mailbox;

    fn record(message_id: &str) -> NormalizedEmail {
        serde_json::from_value(serde_json::json!({
            "internet_message_id": message_id,
            "received_at": "2025-06-01T12:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn empty_message_id_is_rejected() {
        assert!(validate(&record("  ")).is_err());
        assert!(validate(&record("<ok@example.com>")).is_ok());
    }

    #[test]
    fn bad_sender_address_is_rejected() {
        let mut rec = record("<m@example.com>");
        rec.sender = Mailbox { address: "not-an-address".to_string(), display: String::new() };
        assert!(validate(&rec).is_err());
        rec.sender.address = "a@b.com".to_string();
        assert!(validate(&rec).is_ok());
    }

    #[test]
    fn priority_tracks_recommended_phase() {
        assert_eq!(initial_priority(None, Phase::Phase3), Priority::High);
        assert_eq!(initial_priority(None, Phase::Phase2), Priority::Medium);
        assert_eq!(initial_priority(None, Phase::Phase1), Priority::Medium);
    }

    #[test]
    fn importance_overrides_phase_proxy() {
        assert_eq!(
            initial_priority(Some(Importance::High), Phase::Phase1),
            Priority::High
        );
        assert_eq!(
            initial_priority(Some(Importance::Low), Phase::Phase3),
            Priority::Low
        );
    }
}
