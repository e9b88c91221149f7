//! Quality-gate validators and typed parsing for LLM phase responses.

use serde_json::Value;

use mailpipe_core::analysis::{Phase2Result, Phase3Result};

fn confidence_in_range(v: &Value) -> Result<f64, String> {
    let c = v
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| "missing numeric 'confidence'".to_string())?;
    if !(0.0..=1.0).contains(&c) {
        return Err(format!("confidence {} outside [0,1]", c));
    }
    Ok(c)
}

/// Phase 2 gate: the response must parse into the closed schema with a
/// usable confidence. Category typos and malformed action items are
/// rejected here so the adapter's strict retry gets a chance.
pub fn phase2_validator(v: &Value) -> Result<(), String> {
    confidence_in_range(v)?;
    parse_phase2(v).map(|_| ())
}

pub fn parse_phase2(v: &Value) -> Result<Phase2Result, String> {
    serde_json::from_value(v.clone()).map_err(|e| format!("phase2 schema mismatch: {}", e))
}

/// Phase 3 gate: schema parse, non-empty executive summary, probabilities
/// in range.
pub fn phase3_validator(v: &Value) -> Result<(), String> {
    confidence_in_range(v)?;
    let parsed = parse_phase3(v)?;
    if parsed.executive_summary.trim().is_empty() {
        return Err("empty executive_summary".to_string());
    }
    for (key, p) in &parsed.predictive_analytics.outcome_probability {
        if !(0.0..=1.0).contains(p) {
            return Err(format!("outcome '{}' probability {} outside [0,1]", key, p));
        }
    }
    Ok(())
}

pub fn parse_phase3(v: &Value) -> Result<Phase3Result, String> {
    serde_json::from_value(v.clone()).map_err(|e| format!("phase3 schema mismatch: {}", e))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_phase2() -> Value {
        json!({
            "workflow_validation": {"confirmed": true, "category": "order_processing"},
            "missed_entities": {},
            "action_items": [
                {"description": "Send the PO for signature", "owner": "Dana", "deadline": "Friday", "priority": "high"}
            ],
            "risk_assessment": {"level": "medium", "factors": ["deadline pressure"]},
            "confidence": 0.82
        })
    }

    #[test]
    fn accepts_valid_phase2() {
        assert!(phase2_validator(&valid_phase2()).is_ok());
        let parsed = parse_phase2(&valid_phase2()).unwrap();
        assert_eq!(parsed.action_items.len(), 1);
    }

    #[test]
    fn rejects_unknown_category() {
        let mut v = valid_phase2();
        v["workflow_validation"]["category"] = json!("spam_folder");
        assert!(phase2_validator(&v).is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut v = valid_phase2();
        v["confidence"] = json!(1.4);
        assert!(phase2_validator(&v).is_err());
        v["confidence"] = json!("high");
        assert!(phase2_validator(&v).is_err());
    }

    #[test]
    fn rejects_bad_risk_level() {
        let mut v = valid_phase2();
        v["risk_assessment"]["level"] = json!("catastrophic");
        assert!(phase2_validator(&v).is_err());
    }

    fn valid_phase3() -> Value {
        json!({
            "executive_summary": "Order confirmed, expansion likely next quarter.",
            "strategic_intelligence": {
                "market_opportunity": "Server refresh cycle underway.",
                "operational_excellence": "Quote turnaround was fast."
            },
            "predictive_analytics": {
                "outcome_probability": {"repeat_order": 0.7},
                "forecasting": "Expect a follow-on order within 90 days."
            },
            "roi_analysis": "High-margin hardware with attach potential.",
            "confidence": 0.66
        })
    }

    #[test]
    fn accepts_valid_phase3() {
        assert!(phase3_validator(&valid_phase3()).is_ok());
    }

    #[test]
    fn rejects_empty_summary() {
        let mut v = valid_phase3();
        v["executive_summary"] = json!("   ");
        assert!(phase3_validator(&v).is_err());
    }

    #[test]
    fn rejects_probability_above_one() {
        let mut v = valid_phase3();
        v["predictive_analytics"]["outcome_probability"]["repeat_order"] = json!(1.7);
        assert!(phase3_validator(&v).is_err());
    }
}
