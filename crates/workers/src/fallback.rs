//! Rule-derived Phase 2 fallback.
//!
//! When the mid-tier model cannot produce a valid response, the email is
//! still completed with a structured result derived from Phase 1. The
//! fallback confirms the Phase 1 classification and adds nothing that
//! could contradict it: entities stay untouched, confidence never exceeds
//! the Phase 1 confidence.

use mailpipe_core::analysis::{
    ActionItem, EntitySet, Phase1Result, Phase2Result, Priority, RiskAssessment, RiskLevel,
    WorkflowValidation,
};

/// Marker recorded as `model_used` when the fallback is persisted.
pub const FALLBACK_MODEL: &str = "fallback";

pub fn phase2_fallback(p1: &Phase1Result) -> Phase2Result {
    Phase2Result {
        workflow_validation: WorkflowValidation {
            confirmed: true,
            category: p1.workflow_category,
            reason: Some("rule-based fallback, model response unusable".to_string()),
        },
        missed_entities: EntitySet::default(),
        action_items: fallback_actions(p1),
        risk_assessment: RiskAssessment {
            level: risk_level(p1),
            factors: risk_factors(p1),
        },
        suggested_response: None,
        confidence: (p1.confidence * 0.9).clamp(0.1, p1.confidence.max(0.1)),
    }
}

fn fallback_actions(p1: &Phase1Result) -> Vec<ActionItem> {
    let mut items = Vec::new();
    if p1.signals.escalation_marker {
        items.push(ActionItem {
            description: "Respond to the escalation".to_string(),
            owner: None,
            deadline: None,
            priority: Priority::Critical,
        });
    } else if p1.signals.urgency_marker {
        items.push(ActionItem {
            description: "Reply before the stated deadline".to_string(),
            owner: None,
            deadline: p1.entities.dates.first().map(|d| d.value.clone()),
            priority: Priority::High,
        });
    }
    items
}

fn risk_level(p1: &Phase1Result) -> RiskLevel {
    match p1.priority {
        Priority::Critical => RiskLevel::High,
        Priority::High => RiskLevel::Medium,
        Priority::Medium => RiskLevel::Low,
        Priority::Low => RiskLevel::None,
    }
}

fn risk_factors(p1: &Phase1Result) -> Vec<String> {
    let mut factors = Vec::new();
    if p1.signals.escalation_marker {
        factors.push("escalation language present".to_string());
    }
    if p1.signals.urgency_marker {
        factors.push("urgency keywords present".to_string());
    }
    if !p1.entities.money_amounts.is_empty() {
        factors.push("monetary amounts at stake".to_string());
    }
    factors
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mailpipe_core::analysis::{EntityMatch, SignalFlags, WorkflowCategory};

    fn p1() -> Phase1Result {
        Phase1Result {
            workflow_category: WorkflowCategory::OrderProcessing,
            priority: Priority::High,
            entities: EntitySet {
                po_numbers: vec![EntityMatch {
                    value: "12345678".to_string(),
                    confidence: 0.95,
                    span_start: 0,
                    span_end: 8,
                }],
                money_amounts: vec![EntityMatch {
                    value: "$50,000".to_string(),
                    confidence: 0.95,
                    span_start: 20,
                    span_end: 27,
                }],
                ..Default::default()
            },
            signals: SignalFlags {
                workflow_signal: true,
                urgency_marker: true,
                ..Default::default()
            },
            confidence: 0.8,
            rules_version: "test".to_string(),
        }
    }

    #[test]
    fn fallback_confirms_phase1_category() {
        let fb = phase2_fallback(&p1());
        assert!(fb.workflow_validation.confirmed);
        assert_eq!(fb.workflow_validation.category, WorkflowCategory::OrderProcessing);
    }

    #[test]
    fn fallback_never_degrades_phase1_data() {
        let original = p1();
        let fb = phase2_fallback(&original);
        // No entities are emitted that could shadow Phase 1 extractions.
        assert!(fb.missed_entities.is_empty());
        // Confidence never exceeds what Phase 1 established.
        assert!(fb.confidence <= original.confidence);
        // Merging the fallback's (empty) entities into Phase 1's set leaves
        // every Phase 1 entity byte-identical.
        let mut merged = original.entities.clone();
        merged.absorb(fb.missed_entities.clone());
        assert_eq!(merged, original.entities);
    }

    #[test]
    fn urgent_email_gets_deadline_action() {
        let fb = phase2_fallback(&p1());
        assert_eq!(fb.action_items.len(), 1);
        assert_eq!(fb.action_items[0].priority, Priority::High);
    }

    #[test]
    fn escalation_outranks_urgency_action() {
        let mut p = p1();
        p.signals.escalation_marker = true;
        let fb = phase2_fallback(&p);
        assert_eq!(fb.action_items[0].priority, Priority::Critical);
    }

    #[test]
    fn risk_tracks_priority() {
        let mut p = p1();
        assert_eq!(phase2_fallback(&p).risk_assessment.level, RiskLevel::Medium);
        p.priority = Priority::Critical;
        assert_eq!(phase2_fallback(&p).risk_assessment.level, RiskLevel::High);
        p.priority = Priority::Low;
        assert_eq!(phase2_fallback(&p).risk_assessment.level, RiskLevel::None);
    }
}
