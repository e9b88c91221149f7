//! Pure chain scoring: grouping keys, completeness, chain type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use mailpipe_core::analysis::{SignalFlags, WorkflowCategory};
use mailpipe_core::chain::ChainType;
use mailpipe_core::config::ThresholdConfig;
use mailpipe_core::email::sender_domain;
use mailpipe_core::job::Phase;
use mailpipe_rules::patterns;

// ── Grouping ────────────────────────────────────────────────────────

/// Strip reply/forward prefixes, collapse whitespace, lowercase.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim().to_string();
    loop {
        let stripped = patterns::REPLY_SUBJECT.replace(&s, "").trim_start().to_string();
        if stripped.len() == s.len() {
            break;
        }
        s = stripped;
    }
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The chain grouping key: the source conversation id when present, else a
/// hash of the normalized subject scoped by sender domain.
pub fn grouping_key(conversation_id: Option<&str>, subject: &str, sender_address: &str) -> String {
    if let Some(conv) = conversation_id {
        let conv = conv.trim();
        if !conv.is_empty() {
            return format!("conv:{}", conv);
        }
    }
    let normalized = normalize_subject(subject);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let hash_prefix: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("subj:{}:{}", hash_prefix, sender_domain(sender_address))
}

// ── Member view ─────────────────────────────────────────────────────

/// The slice of an email the chain analyzer needs. `signals` and
/// `workflow_category` are present once Phase 1 has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainMemberView {
    pub email_id: Uuid,
    pub subject: String,
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub signals: Option<SignalFlags>,
    pub workflow_category: Option<WorkflowCategory>,
}

impl ChainMemberView {
    fn is_reply(&self) -> bool {
        match self.signals {
            Some(s) => s.is_reply,
            None => patterns::REPLY_SUBJECT.is_match(&self.subject),
        }
    }

    fn has_resolution(&self) -> bool {
        match self.signals {
            Some(s) => s.resolution_marker,
            None => {
                patterns::RESOLUTION.is_match(&self.subject)
                    || patterns::RESOLUTION.is_match(&self.body_preview)
            }
        }
    }

    fn has_action_completion(&self) -> bool {
        match self.signals {
            Some(s) => s.action_completion,
            None => {
                patterns::ACTION_COMPLETION.is_match(&self.subject)
                    || patterns::ACTION_COMPLETION.is_match(&self.body_preview)
            }
        }
    }

    /// A workflow signal observed in conversation context. A lone keyword hit
    /// on a fresh email is not evidence of an observable workflow; the chain
    /// needs a reply, a resolution, or a confirmed action around it.
    fn semantic_evidence(&self) -> bool {
        match self.signals {
            Some(s) => {
                s.workflow_signal && (s.is_reply || s.resolution_marker || s.action_completion)
            }
            None => false,
        }
    }
}

// ── Assessment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAssessment {
    pub completeness: f64,
    pub structural: f64,
    pub semantic: f64,
    pub chain_type: ChainType,
    pub primary_workflow: Option<WorkflowCategory>,
    pub recommended_phase: Phase,
    pub email_count: usize,
    pub first_email_at: Option<DateTime<Utc>>,
    pub last_email_at: Option<DateTime<Utc>>,
}

/// Score a chain from its members.
///
/// * structural = min(1, 0.25·count + 0.25·reply + 0.25·resolution + 0.25·action)
/// * semantic   = fraction of emails with at least one workflow signal
/// * completeness = max(structural, semantic)
pub fn assess(members: &[ChainMemberView], thresholds: &ThresholdConfig) -> ChainAssessment {
    let count = members.len();
    let has_reply = members.iter().any(|m| m.is_reply());
    let has_resolution = members.iter().any(|m| m.has_resolution());
    let has_action = members.iter().any(|m| m.has_action_completion());

    let structural = (0.25 * count as f64
        + 0.25 * has_reply as u8 as f64
        + 0.25 * has_resolution as u8 as f64
        + 0.25 * has_action as u8 as f64)
        .min(1.0);

    let semantic = if count == 0 {
        0.0
    } else {
        let fired = members.iter().filter(|m| m.semantic_evidence()).count();
        (fired as f64 / count as f64).clamp(0.0, 1.0)
    };

    let completeness = structural.max(semantic);

    let chain_type = derive_chain_type(members);
    let primary_workflow = primary_workflow(members);

    let recommended_phase = if completeness >= thresholds.high {
        Phase::Phase3
    } else if completeness >= thresholds.mid {
        Phase::Phase2
    } else {
        Phase::Phase1
    };

    ChainAssessment {
        completeness,
        structural,
        semantic,
        chain_type,
        primary_workflow,
        recommended_phase,
        email_count: count,
        first_email_at: members.iter().map(|m| m.received_at).min(),
        last_email_at: members.iter().map(|m| m.received_at).max(),
    }
}

/// Priority rule over observed workflow signals:
/// escalation > order_processing > quote_request > support_ticket > general.
fn derive_chain_type(members: &[ChainMemberView]) -> ChainType {
    let mut best = ChainType::General;
    let mut best_rank = rank(ChainType::General);
    for m in members {
        let ct = match m.workflow_category {
            Some(cat) => map_category(cat),
            None => continue,
        };
        let r = rank(ct);
        if r < best_rank {
            best = ct;
            best_rank = r;
        }
    }
    best
}

fn rank(ct: ChainType) -> u8 {
    match ct {
        ChainType::Escalation => 0,
        ChainType::OrderProcessing => 1,
        ChainType::QuoteRequest => 2,
        ChainType::SupportTicket => 3,
        ChainType::General => 4,
    }
}

fn map_category(cat: WorkflowCategory) -> ChainType {
    match cat {
        WorkflowCategory::Escalation => ChainType::Escalation,
        WorkflowCategory::OrderProcessing
        | WorkflowCategory::ShippingLogistics
        | WorkflowCategory::Approval => ChainType::OrderProcessing,
        WorkflowCategory::QuoteRequest
        | WorkflowCategory::DealRegistration
        | WorkflowCategory::Renewal => ChainType::QuoteRequest,
        WorkflowCategory::SupportTicket | WorkflowCategory::VendorManagement => {
            ChainType::SupportTicket
        }
        WorkflowCategory::General => ChainType::General,
    }
}

/// Most frequent analyzed category, ties resolved by the classifier's
/// tie-break order.
fn primary_workflow(members: &[ChainMemberView]) -> Option<WorkflowCategory> {
    let mut counts: std::collections::HashMap<WorkflowCategory, usize> =
        std::collections::HashMap::new();
    for m in members {
        if let Some(cat) = m.workflow_category {
            *counts.entry(cat).or_insert(0) += 1;
        }
    }
    if counts.is_empty() {
        return None;
    }
    let mut best: Option<(WorkflowCategory, usize)> = None;
    for cat in WorkflowCategory::TIE_BREAK {
        if let Some(&n) = counts.get(cat) {
            if best.map(|(_, bn)| n > bn).unwrap_or(true) {
                best = Some((*cat, n));
            }
        }
    }
    best.map(|(cat, _)| cat)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig { mid: 0.40, high: 0.70 }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
    }

    fn member(subject: &str, preview: &str, minute: u32) -> ChainMemberView {
        ChainMemberView {
            email_id: Uuid::new_v4(),
            subject: subject.to_string(),
            body_preview: preview.to_string(),
            received_at: at(minute),
            signals: None,
            workflow_category: None,
        }
    }

    fn analyzed(
        subject: &str,
        minute: u32,
        cat: WorkflowCategory,
        signals: SignalFlags,
    ) -> ChainMemberView {
        ChainMemberView {
            email_id: Uuid::new_v4(),
            subject: subject.to_string(),
            body_preview: String::new(),
            received_at: at(minute),
            signals: Some(signals),
            workflow_category: Some(cat),
        }
    }

    #[test]
    fn normalize_strips_repeated_prefixes() {
        assert_eq!(normalize_subject("Re: RE: Fwd:  Quote   Request"), "quote request");
        assert_eq!(normalize_subject("  Plain subject "), "plain subject");
    }

    #[test]
    fn grouping_prefers_conversation_id() {
        let key = grouping_key(Some("AAQkAD123"), "Re: whatever", "a@x.com");
        assert_eq!(key, "conv:AAQkAD123");
    }

    #[test]
    fn grouping_falls_back_to_subject_and_domain() {
        let a = grouping_key(None, "Re: Quote request", "alice@acme.com");
        let b = grouping_key(Some("  "), "quote REQUEST", "bob@acme.com");
        assert_eq!(a, b);
        let other_domain = grouping_key(None, "Quote request", "bob@other.com");
        assert_ne!(a, other_domain);
    }

    #[test]
    fn single_fresh_email_scores_below_mid_threshold() {
        let members = vec![member("Urgent: PO 12345678 approval needed", "", 0)];
        let a = assess(&members, &thresholds());
        assert!(a.completeness < 0.40, "got {}", a.completeness);
        assert_eq!(a.recommended_phase, Phase::Phase1);
        assert_eq!(a.email_count, 1);
    }

    #[test]
    fn four_email_resolved_conversation_recommends_phase3() {
        let fired = SignalFlags { workflow_signal: true, ..Default::default() };
        let closing = SignalFlags {
            workflow_signal: true,
            is_reply: true,
            action_completion: true,
            resolution_marker: true,
            ..Default::default()
        };
        let members = vec![
            analyzed("PO 88112 for servers", 0, WorkflowCategory::OrderProcessing, fired),
            analyzed("Re: PO 88112 for servers", 5, WorkflowCategory::OrderProcessing, SignalFlags { is_reply: true, ..fired }),
            analyzed("Re: PO 88112 for servers", 9, WorkflowCategory::Approval, SignalFlags { is_reply: true, ..fired }),
            analyzed("Re: PO 88112 for servers", 15, WorkflowCategory::OrderProcessing, closing),
        ];
        let a = assess(&members, &thresholds());
        assert!(a.completeness >= 0.70, "got {}", a.completeness);
        assert_eq!(a.chain_type, ChainType::OrderProcessing);
        assert_eq!(a.recommended_phase, Phase::Phase3);
        assert_eq!(a.first_email_at, Some(at(0)));
        assert_eq!(a.last_email_at, Some(at(15)));
    }

    #[test]
    fn semantic_score_is_fraction_of_evidenced_members() {
        let evidenced = SignalFlags { workflow_signal: true, is_reply: true, ..Default::default() };
        let quiet = SignalFlags::default();
        let members = vec![
            analyzed("a", 0, WorkflowCategory::SupportTicket, evidenced),
            analyzed("b", 1, WorkflowCategory::General, quiet),
        ];
        let a = assess(&members, &thresholds());
        assert!((a.semantic - 0.5).abs() < 1e-9);
    }

    #[test]
    fn keyword_hit_alone_is_not_semantic_evidence() {
        // A fresh, unreplied email with a workflow category must not push the
        // chain past the mid threshold on its own.
        let fired = SignalFlags { workflow_signal: true, ..Default::default() };
        let members = vec![analyzed("quote", 0, WorkflowCategory::QuoteRequest, fired)];
        let a = assess(&members, &thresholds());
        assert!((a.semantic - 0.0).abs() < 1e-9);
        assert!(a.completeness < 0.40);
    }

    #[test]
    fn completeness_is_max_of_structural_and_semantic() {
        // One email with a confirmed action: structural 0.5, semantic 1.0.
        let confirmed = SignalFlags {
            workflow_signal: true,
            action_completion: true,
            ..Default::default()
        };
        let members = vec![analyzed("quote", 0, WorkflowCategory::QuoteRequest, confirmed)];
        let a = assess(&members, &thresholds());
        assert!((a.structural - 0.5).abs() < 1e-9);
        assert!((a.semantic - 1.0).abs() < 1e-9);
        assert!((a.completeness - 1.0).abs() < 1e-9);
    }

    #[test]
    fn escalation_outranks_other_chain_types() {
        let fired = SignalFlags { workflow_signal: true, ..Default::default() };
        let members = vec![
            analyzed("order", 0, WorkflowCategory::OrderProcessing, fired),
            analyzed("angry", 1, WorkflowCategory::Escalation, fired),
            analyzed("quote", 2, WorkflowCategory::QuoteRequest, fired),
        ];
        assert_eq!(assess(&members, &thresholds()).chain_type, ChainType::Escalation);
    }

    #[test]
    fn unanalyzed_members_detected_from_text() {
        let members = vec![
            member("Shipping delay", "tracking attached", 0),
            member("Re: Shipping delay", "order has shipped, case closed", 3),
        ];
        let a = assess(&members, &thresholds());
        // 2 emails + reply + resolution + action = 0.5 + 0.75 capped at 1.0.
        assert!(a.structural >= 0.70, "got {}", a.structural);
    }

    #[test]
    fn empty_chain_scores_zero() {
        let a = assess(&[], &thresholds());
        assert_eq!(a.completeness, 0.0);
        assert_eq!(a.recommended_phase, Phase::Phase1);
        assert!(a.first_email_at.is_none());
    }

    #[test]
    fn primary_workflow_is_most_frequent() {
        let fired = SignalFlags { workflow_signal: true, ..Default::default() };
        let members = vec![
            analyzed("a", 0, WorkflowCategory::QuoteRequest, fired),
            analyzed("b", 1, WorkflowCategory::QuoteRequest, fired),
            analyzed("c", 2, WorkflowCategory::SupportTicket, fired),
        ];
        assert_eq!(
            primary_workflow(&members),
            Some(WorkflowCategory::QuoteRequest)
        );
    }
}
