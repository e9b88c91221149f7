//! HTTP handlers.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use mailpipe_core::analysis::Priority;
use mailpipe_core::email::NormalizedEmail;
use mailpipe_core::job::{Job, Phase};
use mailpipe_core::metrics::HealthState;
use mailpipe_core::status::{ui_status, EmailStatus};
use mailpipe_core::OpCtx;
use mailpipe_ingest::{BatchItemResult, IngestError, IngestOutcome};
use mailpipe_store::StoreError;

use crate::state::AppState;

// ── Error envelope ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "admin token required".to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StoreError::Unavailable(m) => ApiError::Unavailable(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<mailpipe_queue::QueueError> for ApiError {
    fn from(e: mailpipe_queue::QueueError) -> Self {
        match e {
            mailpipe_queue::QueueError::Connection(m) => ApiError::Unavailable(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.server.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == expected {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

// ── Ingest ──────────────────────────────────────────────────────────

#[derive(Serialize, ToSchema)]
pub struct IngestResponse {
    pub id: String,
    pub status: String,
}

#[derive(Deserialize)]
pub struct IngestParams {
    /// Priority hint for incremental pushes.
    pub priority: Option<String>,
}

#[utoipa::path(
    post,
    path = "/ingest",
    tag = "Ingest",
    request_body = Object,
    responses(
        (status = 200, description = "Email accepted or duplicate ignored", body = IngestResponse),
        (status = 400, description = "Malformed payload"),
        (status = 503, description = "Store unavailable")
    )
)]
pub async fn ingest_one(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IngestParams>,
    Json(record): Json<NormalizedEmail>,
) -> Result<Json<IngestResponse>, ApiError> {
    let ctx = OpCtx::new();
    let hint = match params.priority.as_deref() {
        Some(raw) => Some(Priority::from_str(raw).map_err(ApiError::BadRequest)?),
        None => None,
    };
    match state.ingest.ingest_one(&ctx, &record, hint).await {
        Ok(IngestOutcome::Accepted(id)) => {
            Ok(Json(IngestResponse { id: id.to_string(), status: "pending".to_string() }))
        }
        Ok(IngestOutcome::Duplicate(id)) => {
            Ok(Json(IngestResponse { id: id.to_string(), status: "duplicate".to_string() }))
        }
        Err(e) => Err(ingest_error(e)),
    }
}

#[utoipa::path(
    post,
    path = "/ingest/batch",
    tag = "Ingest",
    request_body = Object,
    responses(
        (status = 200, description = "Per-item results", body = Object)
    )
)]
pub async fn ingest_batch(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<NormalizedEmail>>,
) -> Json<Vec<BatchItemResult>> {
    let ctx = OpCtx::new();
    Json(state.ingest.ingest_batch(&ctx, &records).await)
}

fn ingest_error(e: IngestError) -> ApiError {
    match e {
        IngestError::Input(m) => ApiError::BadRequest(m),
        IngestError::StoreUnavailable(m) | IngestError::QueueUnavailable(m) => {
            ApiError::Unavailable(m)
        }
        IngestError::Internal(m) => ApiError::Internal(m),
    }
}

// ── Email listing and detail ────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Serialize)]
pub struct EmailSummary {
    pub id: String,
    pub subject: String,
    pub sender_address: String,
    pub received_at: DateTime<Utc>,
    pub status: String,
    pub ui_status: String,
    pub phase_completed: i16,
    pub completeness_score: f64,
    pub recommended_phase: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

#[derive(Serialize)]
pub struct EmailListResponse {
    pub items: Vec<EmailSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

fn summarize(email: &mailpipe_core::email::Email) -> EmailSummary {
    EmailSummary {
        id: email.id.to_string(),
        subject: email.subject.clone(),
        sender_address: email.sender_address.clone(),
        received_at: email.received_at,
        status: email.status.as_str().to_string(),
        ui_status: ui_status(email.status).as_str().to_string(),
        phase_completed: email.phase_completed,
        completeness_score: email.completeness_score,
        recommended_phase: email.recommended_phase,
        chain_id: email.chain_id.map(|c| c.to_string()),
    }
}

fn encode_cursor(at: DateTime<Utc>, id: Uuid) -> String {
    format!("{}:{}", at.timestamp_micros(), id)
}

fn decode_cursor(raw: &str) -> Result<(DateTime<Utc>, Uuid), ApiError> {
    let (micros, id) = raw
        .split_once(':')
        .ok_or_else(|| ApiError::BadRequest("malformed cursor".to_string()))?;
    let micros: i64 = micros
        .parse()
        .map_err(|_| ApiError::BadRequest("malformed cursor".to_string()))?;
    let at = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| ApiError::BadRequest("malformed cursor".to_string()))?;
    let id = Uuid::parse_str(id).map_err(|_| ApiError::BadRequest("malformed cursor".to_string()))?;
    Ok((at, id))
}

#[utoipa::path(
    get,
    path = "/emails",
    tag = "Emails",
    responses(
        (status = 200, description = "Paginated email listing", body = Object)
    )
)]
pub async fn list_emails(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<EmailListResponse>, ApiError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(EmailStatus::from_str(raw).map_err(ApiError::BadRequest)?),
        None => None,
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let cursor = match params.cursor.as_deref() {
        Some(raw) => Some(decode_cursor(raw)?),
        None => None,
    };

    let emails = state.store.list_emails(status, limit, cursor).await?;
    let next_cursor = if emails.len() as i64 == limit {
        emails.last().map(|e| encode_cursor(e.received_at, e.id))
    } else {
        None
    };
    Ok(Json(EmailListResponse {
        items: emails.iter().map(summarize).collect(),
        next_cursor,
    }))
}

#[derive(Serialize)]
pub struct AnalysisDto {
    pub phase: i16,
    pub result: serde_json::Value,
    pub confidence: f64,
    pub model_used: String,
    pub tokens_used: i64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct RecipientDto {
    pub kind: String,
    pub address: String,
    pub display: String,
}

#[derive(Serialize)]
pub struct EmailDetailResponse {
    #[serde(flatten)]
    pub summary: EmailSummary,
    pub internet_message_id: String,
    pub sender_display: String,
    pub body_text: String,
    pub body_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub recipients: Vec<RecipientDto>,
    pub analyses: Vec<AnalysisDto>,
}

#[utoipa::path(
    get,
    path = "/emails/{id}",
    tag = "Emails",
    responses(
        (status = 200, description = "Full record including analyses", body = Object),
        (status = 404, description = "Unknown email")
    )
)]
pub async fn get_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EmailDetailResponse>, ApiError> {
    let record = state.store.get_email_record(id).await?;
    let email = &record.email;
    Ok(Json(EmailDetailResponse {
        summary: summarize(email),
        internet_message_id: email.internet_message_id.clone(),
        sender_display: email.sender_display.clone(),
        body_text: email.body_text.clone(),
        body_preview: email.body_preview.clone(),
        conversation_id: email.conversation_id.clone(),
        analysis_confidence: email.analysis_confidence,
        processing_time_ms: email.processing_time_ms,
        model_used: email.model_used.clone(),
        tokens_used: email.tokens_used,
        error_message: email.error_message.clone(),
        recipients: record
            .recipients
            .iter()
            .map(|r| RecipientDto {
                kind: r.kind.as_str().to_string(),
                address: r.address.clone(),
                display: r.display.clone(),
            })
            .collect(),
        analyses: record
            .analyses
            .into_iter()
            .map(|a| AnalysisDto {
                phase: a.phase,
                result: serde_json::to_value(&a.result).unwrap_or_default(),
                confidence: a.confidence,
                model_used: a.model_used,
                tokens_used: a.tokens_used,
                duration_ms: a.duration_ms,
                created_at: a.created_at,
            })
            .collect(),
    }))
}

// ── Reprocess ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReprocessParams {
    pub from_phase: Option<i16>,
}

#[derive(Serialize, ToSchema)]
pub struct ReprocessResponse {
    pub id: String,
    pub phase: i16,
    pub status: String,
}

#[utoipa::path(
    post,
    path = "/emails/{id}/reprocess",
    tag = "Emails",
    responses(
        (status = 202, description = "Job enqueued", body = ReprocessResponse),
        (status = 401, description = "Admin token required"),
        (status = 409, description = "Email not eligible for the requested phase")
    )
)]
pub async fn reprocess_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<ReprocessParams>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ReprocessResponse>), ApiError> {
    require_admin(&state, &headers)?;

    let phase = Phase::from_number(params.from_phase.unwrap_or(1))
        .ok_or_else(|| ApiError::BadRequest("from_phase must be 1, 2, or 3".to_string()))?;
    let email = state.store.get_email(id).await?;

    if email.status == EmailStatus::Archived {
        return Err(ApiError::Conflict("email is archived".to_string()));
    }
    let eligible = match phase {
        Phase::Phase1 => true,
        Phase::Phase2 => email.phase_completed >= 1,
        // Phase 3 never runs without a completed phase 2; operators retry
        // phase 2 first when it failed.
        Phase::Phase3 => matches!(
            email.status,
            EmailStatus::Phase2Complete | EmailStatus::Phase3Failed | EmailStatus::Phase3Complete
        ),
    };
    if !eligible {
        return Err(ApiError::Conflict(format!(
            "email in status '{}' cannot reprocess from {}",
            email.status, phase
        )));
    }

    // Operator-requested work bypasses the ingest dedup window.
    let mut job = Job::for_email(phase, id, Priority::High, Utc::now());
    job.idempotency_key = format!("reprocess:{}:{}:{}", phase.stream(), id, job.job_id);
    state.queue.enqueue(job).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ReprocessResponse {
            id: id.to_string(),
            phase: phase.number(),
            status: "enqueued".to_string(),
        }),
    ))
}

// ── Health, metrics, stats ──────────────────────────────────────────

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Healthy or degraded", body = Object),
        (status = 503, description = "Store or queue unreachable", body = Object)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health().await;
    let code = match report.status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Health",
    responses(
        (status = 200, description = "Prometheus text exposition", body = String)
    )
)]
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub emails_by_status: HashMap<String, i64>,
    pub total_emails: i64,
    pub chains: i64,
    pub queues: HashMap<String, serde_json::Value>,
    pub dls_depth: u64,
    pub workers_active: HashMap<String, u64>,
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "Health",
    responses(
        (status = 200, description = "Pipeline statistics", body = Object)
    )
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let emails_by_status = state.store.counts_by_status().await?;
    let total_emails = emails_by_status.values().sum();
    let chains = state.store.chain_count().await?;

    let mut queues = HashMap::new();
    let mut workers_active = HashMap::new();
    for stream in Phase::ALL {
        let depth = state.queue.depth(stream).await?;
        queues.insert(
            stream.stream().to_string(),
            serde_json::json!({
                "ready": depth.ready,
                "delayed": depth.delayed,
                "leased": depth.leased,
                "paused": state.queue.is_paused(stream).await?,
            }),
        );
        workers_active.insert(
            stream.stream().to_string(),
            state.metrics.workers_active(stream),
        );
    }

    Ok(Json(StatsResponse {
        uptime_secs: state.uptime_secs(),
        emails_by_status,
        total_emails,
        chains,
        queues,
        dls_depth: state.queue.dls_depth().await?,
        workers_active,
    }))
}

// ── Queue admin ─────────────────────────────────────────────────────

#[utoipa::path(
    get,
    path = "/queue/status",
    tag = "Queue",
    responses(
        (status = 200, description = "Per-stream depth and pause flags", body = Object)
    )
)]
pub async fn queue_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut streams = serde_json::Map::new();
    for stream in Phase::ALL {
        let depth = state.queue.depth(stream).await?;
        streams.insert(
            stream.stream().to_string(),
            serde_json::json!({
                "ready": depth.ready,
                "delayed": depth.delayed,
                "leased": depth.leased,
                "total": depth.total(),
                "paused": state.queue.is_paused(stream).await?,
            }),
        );
    }
    Ok(Json(serde_json::json!({
        "streams": streams,
        "dls_depth": state.queue.dls_depth().await?,
    })))
}

fn parse_stream(raw: &str) -> Result<Phase, ApiError> {
    Phase::from_stream(raw)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown stream '{}'", raw)))
}

#[utoipa::path(
    post,
    path = "/queue/{stream}/pause",
    tag = "Queue",
    responses((status = 200, description = "Stream paused"))
)]
pub async fn pause_stream(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;
    let stream = parse_stream(&stream)?;
    state.queue.pause(stream).await?;
    Ok(Json(serde_json::json!({ "stream": stream.stream(), "paused": true })))
}

#[utoipa::path(
    post,
    path = "/queue/{stream}/resume",
    tag = "Queue",
    responses((status = 200, description = "Stream resumed"))
)]
pub async fn resume_stream(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;
    let stream = parse_stream(&stream)?;
    state.queue.resume(stream).await?;
    Ok(Json(serde_json::json!({ "stream": stream.stream(), "paused": false })))
}

#[derive(Deserialize)]
pub struct RequeueParams {
    pub limit: Option<usize>,
}

#[utoipa::path(
    post,
    path = "/queue/dls/requeue",
    tag = "Queue",
    responses((status = 200, description = "Dead-lettered jobs requeued", body = Object))
)]
pub async fn dls_requeue(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RequeueParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers)?;
    let limit = params.limit.unwrap_or(100).min(1_000);
    let moved = state.queue.dls_requeue(limit).await?;
    Ok(Json(serde_json::json!({ "requeued": moved })))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let at = Utc::now();
        let id = Uuid::new_v4();
        let encoded = encode_cursor(at, id);
        let (at2, id2) = decode_cursor(&encoded).unwrap();
        assert_eq!(at.timestamp_micros(), at2.timestamp_micros());
        assert_eq!(id, id2);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(decode_cursor("nope").is_err());
        assert!(decode_cursor("123").is_err());
        assert!(decode_cursor("abc:def").is_err());
    }

    #[test]
    fn stream_parse() {
        assert!(parse_stream("phase1").is_ok());
        assert!(parse_stream("dls").is_err());
    }
}
