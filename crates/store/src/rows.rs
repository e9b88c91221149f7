//! Row-to-domain mapping helpers.

use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::Row;

use mailpipe_core::analysis::AnalysisResult;
use mailpipe_core::chain::{Chain, ChainType};
use mailpipe_core::email::{Email, Importance};
use mailpipe_core::status::EmailStatus;

use crate::error::StoreError;

pub fn email_from_row(row: &PgRow) -> Result<Email, StoreError> {
    let status_raw: String = get(row, "status")?;
    let status = EmailStatus::from_str(&status_raw).map_err(StoreError::InvalidData)?;
    let importance_raw: String = get(row, "importance")?;
    let importance = match importance_raw.as_str() {
        "low" => Importance::Low,
        "high" => Importance::High,
        _ => Importance::Normal,
    };
    Ok(Email {
        id: get(row, "id")?,
        internet_message_id: get(row, "internet_message_id")?,
        subject: get(row, "subject")?,
        sender_address: get(row, "sender_address")?,
        sender_display: get(row, "sender_display")?,
        body_text: get(row, "body_text")?,
        body_preview: get(row, "body_preview")?,
        received_at: get(row, "received_at")?,
        conversation_id: get(row, "conversation_id")?,
        importance,
        status,
        phase_completed: get(row, "phase_completed")?,
        chain_id: get(row, "chain_id")?,
        completeness_score: get(row, "completeness_score")?,
        recommended_phase: get(row, "recommended_phase")?,
        analysis_confidence: get(row, "analysis_confidence")?,
        processing_time_ms: get(row, "processing_time_ms")?,
        model_used: get(row, "model_used")?,
        tokens_used: get(row, "tokens_used")?,
        error_message: get(row, "error_message")?,
    })
}

pub fn chain_from_row(row: &PgRow) -> Result<Chain, StoreError> {
    let chain_type_raw: String = get(row, "chain_type")?;
    Ok(Chain {
        id: get(row, "id")?,
        group_key: get(row, "group_key")?,
        chain_type: ChainType::parse(&chain_type_raw),
        completeness_score: get(row, "completeness_score")?,
        structural_score: get(row, "structural_score")?,
        semantic_score: get(row, "semantic_score")?,
        email_count: get(row, "email_count")?,
        first_email_at: get(row, "first_email_at")?,
        last_email_at: get(row, "last_email_at")?,
        primary_workflow: get(row, "primary_workflow")?,
        recommended_phase: get(row, "recommended_phase")?,
    })
}

pub fn analysis_from_value(value: serde_json::Value) -> Result<AnalysisResult, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::InvalidData(format!("stored analysis does not parse: {}", e)))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::InvalidData(format!("column '{}': {}", column, e)))
}
