//! Chain records: conversation groups with derived completeness metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    QuoteRequest,
    OrderProcessing,
    SupportTicket,
    Escalation,
    General,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::QuoteRequest => "quote_request",
            ChainType::OrderProcessing => "order_processing",
            ChainType::SupportTicket => "support_ticket",
            ChainType::Escalation => "escalation",
            ChainType::General => "general",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "quote_request" => ChainType::QuoteRequest,
            "order_processing" => ChainType::OrderProcessing,
            "support_ticket" => ChainType::SupportTicket,
            "escalation" => ChainType::Escalation,
            _ => ChainType::General,
        }
    }
}

/// A conversation group. The chain owns no emails: it holds a derived
/// counter and aggregate metadata; emails reference it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: Uuid,
    /// Grouping key: the conversation id when present, else a derived
    /// subject-hash key (see the chain analyzer).
    pub group_key: String,
    pub chain_type: ChainType,
    pub completeness_score: f64,
    pub structural_score: f64,
    pub semantic_score: f64,
    pub email_count: i32,
    pub first_email_at: Option<DateTime<Utc>>,
    pub last_email_at: Option<DateTime<Utc>>,
    pub primary_workflow: Option<String>,
    pub recommended_phase: i16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_type_parse_roundtrip() {
        for ct in [
            ChainType::QuoteRequest,
            ChainType::OrderProcessing,
            ChainType::SupportTicket,
            ChainType::Escalation,
            ChainType::General,
        ] {
            assert_eq!(ChainType::parse(ct.as_str()), ct);
        }
    }

    #[test]
    fn chain_type_parse_unknown_is_general() {
        assert_eq!(ChainType::parse("whatever"), ChainType::General);
    }
}
