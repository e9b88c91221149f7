//! Keyword and marker tables.
//!
//! Tables are versioned via [`crate::RULES_VERSION`]; any change here must
//! bump it.

use mailpipe_core::analysis::WorkflowCategory;
use once_cell::sync::Lazy;
use regex::Regex;

/// One weighted keyword pattern contributing to a category score.
pub struct CategoryPattern {
    pub category: WorkflowCategory,
    pub regex: Regex,
    pub weight: f64,
}

fn pat(category: WorkflowCategory, pattern: &str, weight: f64) -> CategoryPattern {
    CategoryPattern {
        category,
        regex: Regex::new(pattern).expect("static pattern"),
        weight,
    }
}

pub static CATEGORY_PATTERNS: Lazy<Vec<CategoryPattern>> = Lazy::new(|| {
    use WorkflowCategory::*;
    vec![
        // Quote requests
        pat(QuoteRequest, r"(?i)\brfq\b", 2.0),
        pat(QuoteRequest, r"(?i)\bquot(?:e|ation)\b", 1.5),
        pat(QuoteRequest, r"(?i)\bpricing\b", 1.0),
        pat(QuoteRequest, r"(?i)\bprice\s+list\b", 1.0),
        // Order processing
        pat(OrderProcessing, r"(?i)\bpurchase\s+order\b", 2.0),
        pat(OrderProcessing, r"(?i)\bpo\b", 1.0),
        pat(OrderProcessing, r"(?i)\border\s+(?:confirmation|status|update)\b", 1.5),
        pat(OrderProcessing, r"(?i)\binvoice\b", 1.0),
        pat(OrderProcessing, r"(?i)\bpayment\b", 0.5),
        // Shipping / logistics
        pat(ShippingLogistics, r"(?i)\bship(?:ment|ping|ped)\b", 1.5),
        pat(ShippingLogistics, r"(?i)\btracking\s+(?:number|no\.?|#)\b", 1.5),
        pat(ShippingLogistics, r"(?i)\b(?:delivery|freight|carrier)\b", 1.0),
        pat(ShippingLogistics, r"(?i)\beta\b", 0.5),
        // Support tickets
        pat(SupportTicket, r"(?i)\b(?:issue|problem|error|defect|failure)\b", 1.0),
        pat(SupportTicket, r"(?i)\bnot\s+working\b", 1.5),
        pat(SupportTicket, r"(?i)\b(?:support|troubleshoot)\b", 1.0),
        // Escalations
        pat(Escalation, r"(?i)\bescalat(?:e|ion|ing|ed)\b", 3.0),
        pat(Escalation, r"(?i)\bunacceptable\b", 2.0),
        pat(Escalation, r"(?i)\bformal\s+complaint\b", 2.0),
        pat(Escalation, r"(?i)\bstill\s+(?:waiting|no\s+response)\b", 1.5),
        pat(Escalation, r"(?i)\b(?:second|third)\s+request\b", 1.5),
        // Deal registration
        pat(DealRegistration, r"(?i)\bdeal\s+reg(?:istration)?\b", 2.5),
        pat(DealRegistration, r"(?i)\bopportunity\s+(?:id|number)\b", 1.5),
        pat(DealRegistration, r"(?i)\bpartner\s+program\b", 1.0),
        // Approvals
        pat(Approval, r"(?i)\bapprov(?:e|al|als)\b", 1.5),
        pat(Approval, r"(?i)\bsign[\s-]?off\b", 1.5),
        pat(Approval, r"(?i)\bauthoriz(?:e|ation)\b", 1.0),
        // Renewals
        pat(Renewal, r"(?i)\brenew(?:al|ing)?\b", 2.0),
        pat(Renewal, r"(?i)\bexpir(?:es?|ing|ation)\b", 1.0),
        pat(Renewal, r"(?i)\bcontract\s+extension\b", 1.5),
        // Vendor management
        pat(VendorManagement, r"(?i)\b(?:vendor|supplier)\b", 1.5),
        pat(VendorManagement, r"(?i)\bonboarding\b", 1.0),
        pat(VendorManagement, r"(?i)\bw-9\b", 1.5),
        pat(VendorManagement, r"(?i)\binsurance\s+certificate\b", 1.5),
    ]
});

/// Entity-driven score boosts: a strong identifier outweighs loose keywords.
pub const PO_NUMBER_BOOST: f64 = 3.0;
pub const QUOTE_NUMBER_BOOST: f64 = 2.0;
pub const CASE_NUMBER_BOOST: f64 = 2.0;

// ── Marker tables ───────────────────────────────────────────────────

pub static URGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:urgent|asap|immediately|critical|right\s+away|end\s+of\s+day|eod)\b")
        .expect("static pattern")
});

pub static ESCALATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:escalat(?:e|ion|ing|ed)|unacceptable|formal\s+complaint|(?:second|third)\s+request|still\s+(?:waiting|no\s+response))\b",
    )
    .expect("static pattern")
});

/// Closing tokens indicating a workflow reached its end.
pub static RESOLUTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:closed|resolved|completed|issue\s+fixed|all\s+set|case\s+closed)\b")
        .expect("static pattern")
});

/// Action-confirmation phrases ("PO approved", "quote accepted", "shipped").
pub static ACTION_COMPLETION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:po\s+approved|order\s+approved|quote\s+accepted|order\s+(?:has\s+)?shipped|shipped|payment\s+received|signed\s+off)\b",
    )
    .expect("static pattern")
});

pub static REPLY_SUBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:re|fwd?|aw)\s*:").expect("static pattern"));

/// Senders that should never raise priority (bulk mail).
pub static BULK_SENDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:no-?reply|donotreply|newsletter|notifications?)@").expect("static pattern")
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_matches_common_phrases() {
        assert!(URGENCY.is_match("Urgent: need this ASAP"));
        assert!(URGENCY.is_match("please finish by end of day"));
        assert!(!URGENCY.is_match("regular status update"));
    }

    #[test]
    fn action_completion_matches_spec_phrases() {
        assert!(ACTION_COMPLETION.is_match("PO approved, thanks"));
        assert!(ACTION_COMPLETION.is_match("quote accepted"));
        assert!(ACTION_COMPLETION.is_match("your order has shipped"));
        assert!(!ACTION_COMPLETION.is_match("awaiting approval"));
    }

    #[test]
    fn reply_subject_detects_prefixes() {
        assert!(REPLY_SUBJECT.is_match("Re: quote"));
        assert!(REPLY_SUBJECT.is_match("  FWD: shipping"));
        assert!(REPLY_SUBJECT.is_match("fw: hello"));
        assert!(!REPLY_SUBJECT.is_match("Regarding the quote"));
    }

    #[test]
    fn bulk_sender_detection() {
        assert!(BULK_SENDER.is_match("no-reply@vendor.com"));
        assert!(BULK_SENDER.is_match("newsletter@list.example.com"));
        assert!(!BULK_SENDER.is_match("jane.doe@customer.com"));
    }
}
