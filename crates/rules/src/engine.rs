//! The Phase 1 triage engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use mailpipe_core::analysis::{Phase1Result, Priority, SignalFlags, WorkflowCategory};
use mailpipe_core::email::sender_domain;

use crate::entities;
use crate::patterns;
use crate::RULES_VERSION;

/// Confidence reported when nothing at all fires (empty/malformed input).
const BASELINE_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Sender domains treated as customers for priority purposes.
    #[serde(default)]
    pub customer_domains: Vec<String>,
}

/// Deterministic single-email triage. Stateless apart from config; safe to
/// share across workers.
pub struct RuleEngine {
    config: RulesConfig,
}

impl RuleEngine {
    pub fn new(config: RulesConfig) -> Self {
        Self { config }
    }

    /// Analyze one email. `subject` and `body` may both be empty; the result
    /// degrades to `general`/`medium` with baseline confidence.
    pub fn analyze(&self, subject: &str, body: &str, sender_address: &str) -> Phase1Result {
        let text = scan_text(subject, body);

        let entity_set = entities::extract(&text);

        let mut scores: HashMap<WorkflowCategory, f64> = HashMap::new();
        for p in patterns::CATEGORY_PATTERNS.iter() {
            let hits = p.regex.find_iter(&text).count();
            if hits > 0 {
                *scores.entry(p.category).or_insert(0.0) += p.weight * hits.min(3) as f64;
            }
        }
        // Strong identifiers outweigh loose keywords.
        if !entity_set.po_numbers.is_empty() {
            *scores.entry(WorkflowCategory::OrderProcessing).or_insert(0.0) +=
                patterns::PO_NUMBER_BOOST;
        }
        if !entity_set.quote_numbers.is_empty() {
            *scores.entry(WorkflowCategory::QuoteRequest).or_insert(0.0) +=
                patterns::QUOTE_NUMBER_BOOST;
        }
        if !entity_set.case_numbers.is_empty() {
            *scores.entry(WorkflowCategory::SupportTicket).or_insert(0.0) +=
                patterns::CASE_NUMBER_BOOST;
        }

        let (workflow_category, category_score) = pick_category(&scores);

        let signals = SignalFlags {
            workflow_signal: workflow_category != WorkflowCategory::General,
            is_reply: patterns::REPLY_SUBJECT.is_match(subject),
            resolution_marker: patterns::RESOLUTION.is_match(&text),
            action_completion: patterns::ACTION_COMPLETION.is_match(&text),
            urgency_marker: patterns::URGENCY.is_match(&text),
            escalation_marker: patterns::ESCALATION.is_match(&text),
            customer_sender: self.is_customer(sender_address),
        };

        let priority = derive_priority(&signals, sender_address);
        let confidence = overall_confidence(category_score, &entity_set, &signals);

        debug!(
            category = %workflow_category,
            priority = %priority,
            entities = entity_set.total(),
            confidence,
            "phase1 triage"
        );

        Phase1Result {
            workflow_category,
            priority,
            entities: entity_set,
            signals,
            confidence,
            rules_version: RULES_VERSION.to_string(),
        }
    }

    fn is_customer(&self, sender_address: &str) -> bool {
        let domain = sender_domain(sender_address);
        !domain.is_empty()
            && self
                .config
                .customer_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&domain))
    }
}

/// Subject and body are scanned as one text; spans index into this.
fn scan_text(subject: &str, body: &str) -> String {
    let mut text = String::with_capacity(subject.len() + body.len() + 1);
    text.push_str(subject);
    text.push('\n');
    text.push_str(body);
    text
}

fn pick_category(scores: &HashMap<WorkflowCategory, f64>) -> (WorkflowCategory, f64) {
    let mut best = WorkflowCategory::General;
    let mut best_score = 0.0_f64;
    // Walk the tie-break order so equal scores resolve to the earlier entry.
    for cat in WorkflowCategory::TIE_BREAK {
        let score = scores.get(cat).copied().unwrap_or(0.0);
        if score > best_score {
            best = *cat;
            best_score = score;
        }
    }
    (best, best_score)
}

fn derive_priority(signals: &SignalFlags, sender_address: &str) -> Priority {
    if patterns::BULK_SENDER.is_match(sender_address) {
        return Priority::Low;
    }
    if signals.escalation_marker {
        return Priority::Critical;
    }
    if signals.urgency_marker || signals.customer_sender {
        return Priority::High;
    }
    Priority::Medium
}

/// Mean of per-signal confidences, clamped to [0,1].
fn overall_confidence(
    category_score: f64,
    entities: &mailpipe_core::analysis::EntitySet,
    signals: &SignalFlags,
) -> f64 {
    let mut parts: Vec<f64> = Vec::new();
    if category_score > 0.0 {
        parts.push((0.5 + category_score * 0.1).min(0.95));
    }
    for m in entities
        .po_numbers
        .iter()
        .chain(&entities.quote_numbers)
        .chain(&entities.case_numbers)
        .chain(&entities.part_numbers)
        .chain(&entities.money_amounts)
        .chain(&entities.dates)
        .chain(&entities.people)
        .chain(&entities.organizations)
    {
        parts.push(m.confidence);
    }
    for fired in [
        signals.urgency_marker,
        signals.escalation_marker,
        signals.resolution_marker,
        signals.action_completion,
    ] {
        if fired {
            parts.push(0.8);
        }
    }
    if parts.is_empty() {
        return BASELINE_CONFIDENCE;
    }
    (parts.iter().sum::<f64>() / parts.len() as f64).clamp(0.0, 1.0)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RuleEngine {
        RuleEngine::new(RulesConfig::default())
    }

    #[test]
    fn urgent_po_approval_is_order_processing_high() {
        let result = engine().analyze(
            "Urgent: PO 12345678 approval needed",
            "Please approve the purchase. Amount is $50,000, needed by Friday.",
            "buyer@acme.com",
        );
        assert_eq!(result.workflow_category, WorkflowCategory::OrderProcessing);
        assert_eq!(result.priority, Priority::High);
        assert_eq!(result.entities.po_numbers.len(), 1);
        assert_eq!(result.entities.po_numbers[0].value, "12345678");
        assert!(result.entities.po_numbers[0].confidence >= 0.9);
        assert!(result
            .entities
            .money_amounts
            .iter()
            .any(|m| m.value == "$50,000"));
        assert!(result.signals.urgency_marker);
        assert!(!result.signals.escalation_marker);
        assert_eq!(result.rules_version, RULES_VERSION);
    }

    #[test]
    fn empty_input_degrades_gracefully() {
        let result = engine().analyze("", "", "");
        assert_eq!(result.workflow_category, WorkflowCategory::General);
        assert_eq!(result.priority, Priority::Medium);
        assert!(result.entities.is_empty());
        assert!((result.confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn escalation_wins_priority_and_category() {
        let result = engine().analyze(
            "Second request: escalating shipping delay",
            "This is unacceptable. Still waiting on the shipment.",
            "ops@customer.com",
        );
        assert_eq!(result.workflow_category, WorkflowCategory::Escalation);
        assert_eq!(result.priority, Priority::Critical);
        assert!(result.signals.escalation_marker);
    }

    #[test]
    fn customer_domain_raises_priority() {
        let cfg = RulesConfig { customer_domains: vec!["bigcorp.com".to_string()] };
        let result = RuleEngine::new(cfg).analyze(
            "Quote for 40 units",
            "Could you send a quotation for 40 units?",
            "buyer@bigcorp.com",
        );
        assert_eq!(result.workflow_category, WorkflowCategory::QuoteRequest);
        assert_eq!(result.priority, Priority::High);
        assert!(result.signals.customer_sender);
    }

    #[test]
    fn bulk_sender_is_low_priority() {
        let result = engine().analyze(
            "Your weekly newsletter",
            "Click to unsubscribe",
            "no-reply@updates.example.com",
        );
        assert_eq!(result.priority, Priority::Low);
    }

    #[test]
    fn resolution_and_completion_signals_fire() {
        let result = engine().analyze(
            "Re: order 18834",
            "PO approved, quote #QT-9987 accepted. Consider this resolved.",
            "buyer@acme.com",
        );
        assert!(result.signals.is_reply);
        assert!(result.signals.resolution_marker);
        assert!(result.signals.action_completion);
        assert!(result
            .entities
            .quote_numbers
            .iter()
            .any(|m| m.value.eq_ignore_ascii_case("QT-9987")));
    }

    #[test]
    fn deterministic_for_same_input() {
        let e = engine();
        let a = e.analyze("Re: PO 777123", "shipment update", "a@b.com");
        let b = e.analyze("Re: PO 777123", "shipment update", "a@b.com");
        assert_eq!(a, b);
    }

    #[test]
    fn support_ticket_with_case_number() {
        let result = engine().analyze(
            "Printer error, case #55012",
            "The device is not working since yesterday.",
            "it@office.com",
        );
        assert_eq!(result.workflow_category, WorkflowCategory::SupportTicket);
        assert!(result.entities.case_numbers.iter().any(|m| m.value == "55012"));
    }
}
