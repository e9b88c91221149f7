//! Email records: the canonical persisted shape and the normalized ingest shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::EmailStatus;

/// Maximum stored preview length; longer previews are truncated at ingest.
pub const BODY_PREVIEW_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Normal,
    High,
}

impl Default for Importance {
    fn default() -> Self {
        Importance::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
        }
    }
}

/// One recipient row; `position` preserves insertion order within a kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub position: i32,
    pub address: String,
    #[serde(default)]
    pub display: String,
}

/// The canonical email record owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: Uuid,
    pub internet_message_id: String,
    pub subject: String,
    pub sender_address: String,
    pub sender_display: String,
    pub body_text: String,
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub importance: Importance,
    pub status: EmailStatus,
    pub phase_completed: i16,
    pub chain_id: Option<Uuid>,
    pub completeness_score: f64,
    pub recommended_phase: i16,
    pub analysis_confidence: Option<f64>,
    pub processing_time_ms: Option<i64>,
    pub model_used: Option<String>,
    pub tokens_used: Option<i64>,
    pub error_message: Option<String>,
}

impl Email {
    /// Domain part of the sender address, lowercased. Empty when the address
    /// has no '@'.
    pub fn sender_domain(&self) -> String {
        sender_domain(&self.sender_address)
    }
}

pub fn sender_domain(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, dom)| dom.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

// ── Normalized ingest record ────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mailbox {
    pub address: String,
    #[serde(default)]
    pub display: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipientLists {
    #[serde(default)]
    pub to: Vec<Mailbox>,
    #[serde(default)]
    pub cc: Vec<Mailbox>,
    #[serde(default)]
    pub bcc: Vec<Mailbox>,
}

/// The wire shape accepted by the ingest port (batch import and webhook push).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEmail {
    pub internet_message_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sender: Mailbox,
    #[serde(default)]
    pub recipients: RecipientLists,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_preview: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub importance: Option<Importance>,
}

impl NormalizedEmail {
    /// Flatten the recipient lists into ordered rows.
    pub fn recipient_rows(&self) -> Vec<Recipient> {
        let mut rows = Vec::new();
        for (kind, list) in [
            (RecipientKind::To, &self.recipients.to),
            (RecipientKind::Cc, &self.recipients.cc),
            (RecipientKind::Bcc, &self.recipients.bcc),
        ] {
            for (i, mb) in list.iter().enumerate() {
                rows.push(Recipient {
                    kind,
                    position: i as i32,
                    address: mb.address.clone(),
                    display: mb.display.clone(),
                });
            }
        }
        rows
    }

    /// Preview text: supplied preview when present, else the body head.
    /// Truncated to [`BODY_PREVIEW_MAX`] characters.
    pub fn effective_preview(&self) -> String {
        let raw = self
            .body_preview
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.body_text);
        raw.chars().take(BODY_PREVIEW_MAX).collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> NormalizedEmail {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn normalized_email_minimal_deserialize() {
        let rec = record(
            r#"{"internet_message_id":"<m1@example.com>","received_at":"2025-06-01T12:00:00Z"}"#,
        );
        assert_eq!(rec.internet_message_id, "<m1@example.com>");
        assert_eq!(rec.subject, "");
        assert!(rec.recipients.to.is_empty());
        assert!(rec.importance.is_none());
    }

    #[test]
    fn recipient_rows_preserve_order_within_kind() {
        let rec = record(
            r#"{
                "internet_message_id": "<m2@example.com>",
                "received_at": "2025-06-01T12:00:00Z",
                "recipients": {
                    "to": [
                        {"address": "a@x.com", "display": "A"},
                        {"address": "b@x.com", "display": "B"}
                    ],
                    "cc": [{"address": "c@x.com"}]
                }
            }"#,
        );
        let rows = rec.recipient_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].address, "a@x.com");
        assert_eq!(rows[0].position, 0);
        assert_eq!(rows[1].address, "b@x.com");
        assert_eq!(rows[1].position, 1);
        assert_eq!(rows[2].kind, RecipientKind::Cc);
        assert_eq!(rows[2].position, 0);
    }

    #[test]
    fn effective_preview_truncates() {
        let mut rec = record(
            r#"{"internet_message_id":"<m3@example.com>","received_at":"2025-06-01T12:00:00Z"}"#,
        );
        rec.body_text = "x".repeat(2000);
        assert_eq!(rec.effective_preview().len(), BODY_PREVIEW_MAX);
    }

    #[test]
    fn sender_domain_lowercases() {
        assert_eq!(sender_domain("Buyer@Acme.COM"), "acme.com");
        assert_eq!(sender_domain("no-at-sign"), "");
    }
}
