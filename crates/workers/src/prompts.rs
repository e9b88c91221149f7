//! Prompt construction for the LLM phases.

use mailpipe_chain::scoring::ChainMemberView;
use mailpipe_core::analysis::{Phase1Result, Phase2Result};
use mailpipe_core::email::Email;
use mailpipe_llm::JsonRequest;

/// Sibling summaries included in the Phase 2 context.
pub const PHASE2_CONTEXT_SIBLINGS: usize = 5;

/// Phase 3 chain rollup budget, approximated in characters (~4 per token
/// against a 16k-token cap).
pub const PHASE3_CONTEXT_BUDGET_CHARS: usize = 64_000;

const SIBLING_PREVIEW_CHARS: usize = 240;

/// Render one chain member as a single context line.
fn member_line(m: &ChainMemberView) -> String {
    let preview: String = m.body_preview.chars().take(SIBLING_PREVIEW_CHARS).collect();
    let category = m
        .workflow_category
        .map(|c| c.as_str())
        .unwrap_or("unanalyzed");
    format!(
        "- [{}] ({}) {}: {}",
        m.received_at.format("%Y-%m-%d %H:%M"),
        category,
        m.subject,
        preview.replace('\n', " ")
    )
}

/// Compact chain context: up to `limit` prior siblings, oldest first.
pub fn sibling_context(members: &[ChainMemberView], exclude: uuid::Uuid, limit: usize) -> String {
    let lines: Vec<String> = members
        .iter()
        .filter(|m| m.email_id != exclude)
        .rev()
        .take(limit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(member_line)
        .collect();
    if lines.is_empty() {
        "(no prior emails in this chain)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Budget-capped rollup of the whole chain for Phase 3.
pub fn chain_rollup(members: &[ChainMemberView], budget_chars: usize) -> String {
    let mut out = String::new();
    for m in members {
        let line = member_line(m);
        if out.len() + line.len() + 1 > budget_chars {
            out.push_str("- (earlier context truncated)\n");
            break;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn build_phase2_request(
    email: &Email,
    p1: &Phase1Result,
    members: &[ChainMemberView],
) -> JsonRequest {
    let p1_json = serde_json::to_string_pretty(p1).unwrap_or_else(|_| "{}".to_string());
    let context = sibling_context(members, email.id, PHASE2_CONTEXT_SIBLINGS);

    let system = r#"You are an email operations analyst. You receive one business email, the structured result of a rule-based triage pass, and compact context from the surrounding conversation. Validate the triage, surface what it missed, and extract concrete follow-ups.

Respond with a JSON object exactly matching this schema:
{
  "workflow_validation": {"confirmed": bool, "category": "quote_request|order_processing|shipping_logistics|support_ticket|escalation|deal_registration|approval|renewal|vendor_management|general", "reason": "string (optional)"},
  "missed_entities": {"po_numbers": [], "quote_numbers": [], "case_numbers": [], "part_numbers": [], "money_amounts": [], "dates": [], "people": [], "organizations": []},
  "action_items": [{"description": "string", "owner": "string or null", "deadline": "string or null", "priority": "critical|high|medium|low"}],
  "risk_assessment": {"level": "none|low|medium|high|critical", "factors": ["string"]},
  "suggested_response": "string (optional)",
  "confidence": 0.0
}

Each entry in missed_entities lists objects of the form {"value": "string", "confidence": 0.0, "span_start": 0, "span_end": 0}. Only include entities the triage pass missed. Respond with ONLY the JSON object."#;

    let user = format!(
        "## Email\nFrom: {} <{}>\nSubject: {}\nReceived: {}\n\n{}\n\n## Rule-based triage result\n{}\n\n## Conversation context\n{}",
        email.sender_display,
        email.sender_address,
        email.subject,
        email.received_at.to_rfc3339(),
        email.body_text,
        p1_json,
        context
    );

    JsonRequest { system: system.to_string(), user, stop: vec![] }
}

pub fn build_phase3_request(
    email: &Email,
    p1: &Phase1Result,
    p2: &Phase2Result,
    members: &[ChainMemberView],
) -> JsonRequest {
    let p1_json = serde_json::to_string_pretty(p1).unwrap_or_else(|_| "{}".to_string());
    let p2_json = serde_json::to_string_pretty(p2).unwrap_or_else(|_| "{}".to_string());
    let rollup = chain_rollup(members, PHASE3_CONTEXT_BUDGET_CHARS);

    let system = r#"You are a senior business strategist reviewing a fully analyzed email conversation. Produce executive-level intelligence: what this conversation means for the business, where it is likely headed, and what return is at stake.

Respond with a JSON object exactly matching this schema:
{
  "executive_summary": "string",
  "strategic_intelligence": {"market_opportunity": "string", "operational_excellence": "string"},
  "predictive_analytics": {"outcome_probability": {"<outcome>": 0.0}, "forecasting": "string"},
  "roi_analysis": "string",
  "confidence": 0.0
}

Probabilities are in [0,1]. Respond with ONLY the JSON object."#;

    let user = format!(
        "## Conversation rollup\n{}\n## Focus email\nSubject: {}\nFrom: {}\n\n## Triage result\n{}\n\n## Enhancement result\n{}",
        rollup, email.subject, email.sender_address, p1_json, p2_json
    );

    JsonRequest { system: system.to_string(), user, stop: vec![] }
}

// ── Tests ───────────────────────────────────────────────────────────
