//! Store operations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mailpipe_chain::analyzer::{ChainError, ChainStore};
use mailpipe_chain::scoring::{ChainAssessment, ChainMemberView};
use mailpipe_core::analysis::AnalysisResult;
use mailpipe_core::chain::Chain;
use mailpipe_core::config::StoreConfig;
use mailpipe_core::email::{Email, NormalizedEmail, Recipient, RecipientKind};
use mailpipe_core::status::{is_valid_transition, EmailStatus};

use crate::error::{is_transient, StoreError};
use crate::rows::{analysis_from_value, chain_from_row, email_from_row};

/// Confidence tolerance for idempotent replacement: a redelivered phase may
/// replace its stored result only when the new confidence is within this
/// margin of the old one.
const REPLACE_TOLERANCE: f64 = 0.05;

const RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Uuid),
    Existing(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Existing(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

/// Extra fields carried atomically with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// Set on failure transitions; cleared (NULL) otherwise.
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRow {
    pub phase: i16,
    pub result: AnalysisResult,
    pub confidence: f64,
    pub model_used: String,
    pub tokens_used: i64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Full dashboard record: the email plus recipients and all phase results.
#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub email: Email,
    pub recipients: Vec<Recipient>,
    pub analyses: Vec<AnalysisRow>,
}

pub struct Store {
    pool: PgPool,
}

/// Retry transient I/O with bounded backoff; everything else surfaces.
async fn retrying<T, F, Fut>(label: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt < RETRY_ATTEMPTS => {
                warn!(op = label, attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => return Err(StoreError::from_sqlx(e)),
        }
    }
}

impl Store {
    /// Connect and run migrations.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migrations failed: {}", e)))?;
        info!("store connected, migrations applied");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        retrying("ping", || async move {
            sqlx::query("SELECT 1").execute(&self.pool).await.map(|_| ())
        })
        .await
    }

    // ── Emails ──────────────────────────────────────────────────────

    /// Idempotent on `internet_message_id`. New rows start `pending`;
    /// recipients are written only on first insert.
    pub async fn upsert_email(&self, rec: &NormalizedEmail) -> Result<UpsertOutcome, StoreError> {
        let id = Uuid::new_v4();
        let importance = match rec.importance {
            Some(mailpipe_core::email::Importance::Low) => "low",
            Some(mailpipe_core::email::Importance::High) => "high",
            _ => "normal",
        };

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO emails (
                id, internet_message_id, subject, sender_address, sender_display,
                body_text, body_preview, received_at, conversation_id, importance, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
            ON CONFLICT (internet_message_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&rec.internet_message_id)
        .bind(&rec.subject)
        .bind(&rec.sender.address)
        .bind(&rec.sender.display)
        .bind(&rec.body_text)
        .bind(rec.effective_preview())
        .bind(rec.received_at)
        .bind(&rec.conversation_id)
        .bind(importance)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        match inserted {
            Some(id) => {
                for r in rec.recipient_rows() {
                    sqlx::query(
                        "INSERT INTO recipients (email_id, kind, position, address, display)
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(id)
                    .bind(r.kind.as_str())
                    .bind(r.position)
                    .bind(&r.address)
                    .bind(&r.display)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::from_sqlx)?;
                }
                tx.commit().await.map_err(StoreError::from_sqlx)?;
                debug!(email_id = %id, message_id = %rec.internet_message_id, "email created");
                Ok(UpsertOutcome::Created(id))
            }
            None => {
                tx.commit().await.map_err(StoreError::from_sqlx)?;
                let existing: Uuid = retrying("find_existing_email", || async move {
                    sqlx::query_scalar("SELECT id FROM emails WHERE internet_message_id = $1")
                        .bind(&rec.internet_message_id)
                        .fetch_one(&self.pool)
                        .await
                })
                .await?;
                Ok(UpsertOutcome::Existing(existing))
            }
        }
    }

    pub async fn get_email(&self, id: Uuid) -> Result<Email, StoreError> {
        let row = retrying("get_email", || async move {
            sqlx::query("SELECT * FROM emails WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("email {}", id)))?;
        email_from_row(&row)
    }

    pub async fn get_email_record(&self, id: Uuid) -> Result<EmailRecord, StoreError> {
        let email = self.get_email(id).await?;

        let recipient_rows = retrying("get_recipients", || async move {
            sqlx::query(
                "SELECT kind, position, address, display FROM recipients
                 WHERE email_id = $1
                 ORDER BY CASE kind WHEN 'to' THEN 0 WHEN 'cc' THEN 1 ELSE 2 END, position",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut recipients = Vec::with_capacity(recipient_rows.len());
        for row in &recipient_rows {
            let kind: String = row.try_get("kind").map_err(StoreError::from_sqlx)?;
            let kind = match kind.as_str() {
                "to" => RecipientKind::To,
                "cc" => RecipientKind::Cc,
                _ => RecipientKind::Bcc,
            };
            recipients.push(Recipient {
                kind,
                position: row.try_get("position").map_err(StoreError::from_sqlx)?,
                address: row.try_get("address").map_err(StoreError::from_sqlx)?,
                display: row.try_get("display").map_err(StoreError::from_sqlx)?,
            });
        }

        let analysis_rows = retrying("get_analyses", || async move {
            sqlx::query(
                "SELECT phase, result, confidence, model_used, tokens_used, duration_ms, created_at
                 FROM analyses WHERE email_id = $1 ORDER BY phase",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut analyses = Vec::with_capacity(analysis_rows.len());
        for row in analysis_rows {
            let value: serde_json::Value = row.try_get("result").map_err(StoreError::from_sqlx)?;
            analyses.push(AnalysisRow {
                phase: row.try_get("phase").map_err(StoreError::from_sqlx)?,
                result: analysis_from_value(value)?,
                confidence: row.try_get("confidence").map_err(StoreError::from_sqlx)?,
                model_used: row.try_get("model_used").map_err(StoreError::from_sqlx)?,
                tokens_used: row.try_get("tokens_used").map_err(StoreError::from_sqlx)?,
                duration_ms: row.try_get("duration_ms").map_err(StoreError::from_sqlx)?,
                created_at: row.try_get("created_at").map_err(StoreError::from_sqlx)?,
            });
        }

        Ok(EmailRecord { email, recipients, analyses })
    }

    /// Oldest-first candidates for batch processing.
    pub async fn list_for_processing(
        &self,
        status: EmailStatus,
        limit: i64,
    ) -> Result<Vec<Email>, StoreError> {
        let rows = retrying("list_for_processing", || async move {
            sqlx::query(
                "SELECT * FROM emails WHERE status = $1 ORDER BY received_at ASC LIMIT $2",
            )
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        rows.iter().map(email_from_row).collect()
    }

    /// Dashboard listing: newest first with keyset pagination.
    pub async fn list_emails(
        &self,
        status: Option<EmailStatus>,
        limit: i64,
        cursor: Option<(DateTime<Utc>, Uuid)>,
    ) -> Result<Vec<Email>, StoreError> {
        let status_str = status.map(|s| s.as_str().to_string());
        let (cursor_at, cursor_id) = match cursor {
            Some((at, id)) => (Some(at), Some(id)),
            None => (None, None),
        };
        let rows = retrying("list_emails", || {
            let status_str = status_str.clone();
            async move {
                sqlx::query(
                    r#"
                SELECT * FROM emails
                WHERE ($1::text IS NULL OR status = $1)
                  AND ($2::timestamptz IS NULL OR (received_at, id) < ($2, $3))
                ORDER BY received_at DESC, id DESC
                LIMIT $4
                "#,
                )
                .bind(&status_str)
                .bind(cursor_at)
                .bind(cursor_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        })
        .await?;
        rows.iter().map(email_from_row).collect()
    }

    /// Optimistic-concurrency status transition, validated against the state
    /// machine. Atomic with the carried field updates.
    pub async fn update_status(
        &self,
        id: Uuid,
        from: EmailStatus,
        to: EmailStatus,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        if !is_valid_transition(from, to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let result = retrying("update_status", || {
            let error_message = update.error_message.clone();
            async move {
                sqlx::query(
                    "UPDATE emails
                 SET status = $3,
                     phase_completed = GREATEST(phase_completed, $4),
                     error_message = $5,
                     updated_at = now()
                 WHERE id = $1 AND status = $2",
                )
                .bind(id)
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(to.implied_phase())
                .bind(&error_message)
                .execute(&self.pool)
                .await
            }
        })
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get_email(id).await?.status;
            return Err(StoreError::Conflict { expected: from, current });
        }
        debug!(email_id = %id, from = %from, to = %to, "status transition");
        Ok(())
    }

    /// Atomic phase-result append. `(email_id, phase)` is unique; a replay
    /// replaces the stored result only within the confidence tolerance.
    /// Returns whether the analysis row was written.
    pub async fn append_phase_result(
        &self,
        email_id: Uuid,
        result: &AnalysisResult,
        confidence: f64,
        tokens: i64,
        model: &str,
        duration_ms: i64,
    ) -> Result<bool, StoreError> {
        result.validate().map_err(StoreError::InvalidData)?;
        let phase = result.phase_number();
        let rules_version = match result {
            AnalysisResult::Phase1(r) => Some(r.rules_version.clone()),
            _ => None,
        };
        let value =
            serde_json::to_value(result).map_err(|e| StoreError::InvalidData(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let applied: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO analyses
                (email_id, phase, result, confidence, model_used, tokens_used, duration_ms, rules_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (email_id, phase) DO UPDATE SET
                result = EXCLUDED.result,
                confidence = EXCLUDED.confidence,
                model_used = EXCLUDED.model_used,
                tokens_used = EXCLUDED.tokens_used,
                duration_ms = EXCLUDED.duration_ms,
                rules_version = EXCLUDED.rules_version,
                updated_at = now()
            WHERE analyses.confidence <= EXCLUDED.confidence + $9
            RETURNING email_id
            "#,
        )
        .bind(email_id)
        .bind(phase)
        .bind(&value)
        .bind(confidence)
        .bind(model)
        .bind(tokens)
        .bind(duration_ms)
        .bind(rules_version)
        .bind(REPLACE_TOLERANCE)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        if applied.is_some() {
            sqlx::query(
                "UPDATE emails
                 SET phase_completed = GREATEST(phase_completed, $2),
                     analysis_confidence = $3,
                     model_used = $4,
                     tokens_used = $5,
                     processing_time_ms = $6,
                     updated_at = now()
                 WHERE id = $1",
            )
            .bind(email_id)
            .bind(phase)
            .bind(confidence)
            .bind(model)
            .bind(tokens)
            .bind(duration_ms)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        } else {
            debug!(
                email_id = %email_id,
                phase,
                confidence,
                "phase result replay below confidence tolerance, keeping stored result"
            );
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(applied.is_some())
    }

    pub async fn get_analysis(
        &self,
        email_id: Uuid,
        phase: i16,
    ) -> Result<Option<(AnalysisResult, f64)>, StoreError> {
        let row = retrying("get_analysis", || async move {
            sqlx::query("SELECT result, confidence FROM analyses WHERE email_id = $1 AND phase = $2")
                .bind(email_id)
                .bind(phase)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        match row {
            Some(row) => {
                let value: serde_json::Value =
                    row.try_get("result").map_err(StoreError::from_sqlx)?;
                let confidence: f64 = row.try_get("confidence").map_err(StoreError::from_sqlx)?;
                Ok(Some((analysis_from_value(value)?, confidence)))
            }
            None => Ok(None),
        }
    }

    // ── Chains ──────────────────────────────────────────────────────

    pub async fn find_or_create_chain(&self, group_key: &str) -> Result<Chain, StoreError> {
        let id = Uuid::new_v4();
        let inserted = retrying("create_chain", || async move {
            sqlx::query(
                "INSERT INTO chains (id, group_key) VALUES ($1, $2)
                 ON CONFLICT (group_key) DO NOTHING
                 RETURNING *",
            )
            .bind(id)
            .bind(group_key)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        if let Some(row) = inserted {
            debug!(chain_id = %id, group_key, "chain created");
            return chain_from_row(&row);
        }

        let row = retrying("find_chain", || async move {
            sqlx::query("SELECT * FROM chains WHERE group_key = $1")
                .bind(group_key)
                .fetch_one(&self.pool)
                .await
        })
        .await?;
        chain_from_row(&row)
    }

    pub async fn get_chain(&self, id: Uuid) -> Result<Chain, StoreError> {
        let row = retrying("get_chain", || async move {
            sqlx::query("SELECT * FROM chains WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
        })
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("chain {}", id)))?;
        chain_from_row(&row)
    }

    /// Attach an email to a chain and bump the counter, atomically. Returns
    /// false when the email was already attached (replay-safe).
    pub async fn attach_email_to_chain(
        &self,
        email_id: Uuid,
        chain_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let updated = sqlx::query(
            "UPDATE emails SET chain_id = $2, updated_at = now()
             WHERE id = $1 AND chain_id IS NULL",
        )
        .bind(email_id)
        .bind(chain_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.ok();
            let existing: Option<Option<Uuid>> =
                sqlx::query_scalar("SELECT chain_id FROM emails WHERE id = $1")
                    .bind(email_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(StoreError::from_sqlx)?;
            return match existing {
                None => Err(StoreError::NotFound(format!("email {}", email_id))),
                Some(Some(current)) if current == chain_id => Ok(false),
                Some(current) => Err(StoreError::InvalidData(format!(
                    "email {} already belongs to chain {:?}",
                    email_id, current
                ))),
            };
        }

        sqlx::query(
            "UPDATE chains SET
                 email_count = email_count + 1,
                 first_email_at = LEAST(COALESCE(first_email_at, e.received_at), e.received_at),
                 last_email_at = GREATEST(COALESCE(last_email_at, e.received_at), e.received_at),
                 updated_at = now()
             FROM emails e
             WHERE chains.id = $1 AND e.id = $2",
        )
        .bind(chain_id)
        .bind(email_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(true)
    }

    /// Member views for the chain analyzer, oldest first, with Phase 1
    /// signals where available.
    pub async fn chain_member_views(
        &self,
        chain_id: Uuid,
    ) -> Result<Vec<ChainMemberView>, StoreError> {
        let rows = retrying("chain_member_views", || async move {
            sqlx::query(
                "SELECT e.id, e.subject, e.body_preview, e.received_at, a.result
                 FROM emails e
                 LEFT JOIN analyses a ON a.email_id = e.id AND a.phase = 1
                 WHERE e.chain_id = $1
                 ORDER BY e.received_at ASC",
            )
            .bind(chain_id)
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Option<serde_json::Value> =
                row.try_get("result").map_err(StoreError::from_sqlx)?;
            let phase1 = value.and_then(|v| match analysis_from_value(v) {
                Ok(AnalysisResult::Phase1(p1)) => Some(p1),
                _ => None,
            });
            members.push(ChainMemberView {
                email_id: row.try_get("id").map_err(StoreError::from_sqlx)?,
                subject: row.try_get("subject").map_err(StoreError::from_sqlx)?,
                body_preview: row.try_get("body_preview").map_err(StoreError::from_sqlx)?,
                received_at: row.try_get("received_at").map_err(StoreError::from_sqlx)?,
                signals: phase1.as_ref().map(|p| p.signals),
                workflow_category: phase1.as_ref().map(|p| p.workflow_category),
            });
        }
        Ok(members)
    }

    /// Persist a chain assessment and propagate the derived fields onto the
    /// member emails, in one transaction.
    pub async fn save_chain_assessment(
        &self,
        chain_id: Uuid,
        a: &ChainAssessment,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        sqlx::query(
            "UPDATE chains SET
                 chain_type = $2,
                 completeness_score = $3,
                 structural_score = $4,
                 semantic_score = $5,
                 primary_workflow = $6,
                 recommended_phase = $7,
                 email_count = $8,
                 first_email_at = COALESCE($9, first_email_at),
                 last_email_at = COALESCE($10, last_email_at),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(chain_id)
        .bind(a.chain_type.as_str())
        .bind(a.completeness)
        .bind(a.structural)
        .bind(a.semantic)
        .bind(a.primary_workflow.map(|w| w.as_str().to_string()))
        .bind(a.recommended_phase.number())
        .bind(a.email_count as i32)
        .bind(a.first_email_at)
        .bind(a.last_email_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query(
            "UPDATE emails SET
                 completeness_score = $2,
                 recommended_phase = $3,
                 updated_at = now()
             WHERE chain_id = $1",
        )
        .bind(chain_id)
        .bind(a.completeness)
        .bind(a.recommended_phase.number())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Ids of chain members currently in `status` (used to advance siblings
    /// when a chain crosses a depth threshold).
    pub async fn chain_email_ids_with_status(
        &self,
        chain_id: Uuid,
        status: EmailStatus,
    ) -> Result<Vec<Uuid>, StoreError> {
        retrying("chain_email_ids_with_status", || async move {
            sqlx::query_scalar(
                "SELECT id FROM emails WHERE chain_id = $1 AND status = $2 ORDER BY received_at",
            )
            .bind(chain_id)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
        })
        .await
    }

    // ── Stats ───────────────────────────────────────────────────────

    pub async fn counts_by_status(&self) -> Result<HashMap<String, i64>, StoreError> {
        let rows: Vec<(String, i64)> = retrying("counts_by_status", || async move {
            sqlx::query_as("SELECT status, COUNT(*) FROM emails GROUP BY status")
                .fetch_all(&self.pool)
                .await
        })
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn chain_count(&self) -> Result<i64, StoreError> {
        retrying("chain_count", || async move {
            sqlx::query_scalar("SELECT COUNT(*) FROM chains")
                .fetch_one(&self.pool)
                .await
        })
        .await
    }
}

// ── Chain analyzer seam ─────────────────────────────────────────────

#[async_trait]
impl ChainStore for Store {
    async fn find_or_create_chain(&self, group_key: &str) -> Result<Chain, ChainError> {
        Store::find_or_create_chain(self, group_key)
            .await
            .map_err(|e| ChainError::Store(e.to_string()))
    }

    async fn attach_email(&self, email_id: Uuid, chain_id: Uuid) -> Result<bool, ChainError> {
        self.attach_email_to_chain(email_id, chain_id)
            .await
            .map_err(|e| ChainError::Store(e.to_string()))
    }

    async fn chain_members(&self, chain_id: Uuid) -> Result<Vec<ChainMemberView>, ChainError> {
        self.chain_member_views(chain_id)
            .await
            .map_err(|e| ChainError::Store(e.to_string()))
    }

    async fn save_assessment(
        &self,
        chain_id: Uuid,
        assessment: &ChainAssessment,
    ) -> Result<(), ChainError> {
        self.save_chain_assessment(chain_id, assessment)
            .await
            .map_err(|e| ChainError::Store(e.to_string()))
    }
}
