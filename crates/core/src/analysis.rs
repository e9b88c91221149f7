//! Phase result schemas.
//!
//! Every phase produces a closed, typed record validated before persistence.
//! The store treats these as opaque JSON but the pipeline only ever writes
//! values that round-trip through these types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Priority ────────────────────────────────────────────────────────

/// Four-level priority. Legacy feeds sometimes carry a fifth level
/// ("urgent"); it maps to `Critical` on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Queue ordering rank: lower number dequeues earlier.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 | 1 => Priority::Critical,
            2 => Priority::High,
            3 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    /// One level more urgent (critical stays critical).
    pub fn promoted(&self) -> Self {
        Priority::from_rank(self.rank().saturating_sub(1).max(1))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" | "urgent" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" | "normal" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

// ── Workflow categories ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    QuoteRequest,
    OrderProcessing,
    ShippingLogistics,
    SupportTicket,
    Escalation,
    DealRegistration,
    Approval,
    Renewal,
    VendorManagement,
    General,
}

impl WorkflowCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowCategory::QuoteRequest => "quote_request",
            WorkflowCategory::OrderProcessing => "order_processing",
            WorkflowCategory::ShippingLogistics => "shipping_logistics",
            WorkflowCategory::SupportTicket => "support_ticket",
            WorkflowCategory::Escalation => "escalation",
            WorkflowCategory::DealRegistration => "deal_registration",
            WorkflowCategory::Approval => "approval",
            WorkflowCategory::Renewal => "renewal",
            WorkflowCategory::VendorManagement => "vendor_management",
            WorkflowCategory::General => "general",
        }
    }

    /// Tie-break order for classification: earlier wins on equal scores.
    pub const TIE_BREAK: &'static [WorkflowCategory] = &[
        WorkflowCategory::Escalation,
        WorkflowCategory::OrderProcessing,
        WorkflowCategory::QuoteRequest,
        WorkflowCategory::SupportTicket,
        WorkflowCategory::DealRegistration,
        WorkflowCategory::Approval,
        WorkflowCategory::Renewal,
        WorkflowCategory::ShippingLogistics,
        WorkflowCategory::VendorManagement,
        WorkflowCategory::General,
    ];
}

impl fmt::Display for WorkflowCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ────────────────────────────────────────────────────────

/// A single extracted entity with the character span it came from.
/// Spans index into the scanned text (subject + newline + body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatch {
    pub value: String,
    pub confidence: f64,
    pub span_start: usize,
    pub span_end: usize,
}

/// Closed entity map: one list per recognized kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub po_numbers: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quote_numbers: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case_numbers: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_numbers: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub money_amounts: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dates: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub people: Vec<EntityMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<EntityMatch>,
}

impl EntitySet {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.po_numbers.len()
            + self.quote_numbers.len()
            + self.case_numbers.len()
            + self.part_numbers.len()
            + self.money_amounts.len()
            + self.dates.len()
            + self.people.len()
            + self.organizations.len()
    }

    /// Merge `other` into `self`, keeping existing matches untouched and
    /// appending only values not already present in the same kind.
    pub fn absorb(&mut self, other: EntitySet) {
        fn merge(dst: &mut Vec<EntityMatch>, src: Vec<EntityMatch>) {
            for m in src {
                if !dst.iter().any(|e| e.value == m.value) {
                    dst.push(m);
                }
            }
        }
        merge(&mut self.po_numbers, other.po_numbers);
        merge(&mut self.quote_numbers, other.quote_numbers);
        merge(&mut self.case_numbers, other.case_numbers);
        merge(&mut self.part_numbers, other.part_numbers);
        merge(&mut self.money_amounts, other.money_amounts);
        merge(&mut self.dates, other.dates);
        merge(&mut self.people, other.people);
        merge(&mut self.organizations, other.organizations);
    }
}

// ── Signals ─────────────────────────────────────────────────────────

/// Boolean feature flags produced by Phase 1 and consumed by the chain
/// analyzer's semantic rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFlags {
    /// At least one workflow keyword pattern fired.
    pub workflow_signal: bool,
    /// Subject carries a reply marker (Re:/Fwd:).
    pub is_reply: bool,
    /// Closing tokens present ("closed", "resolved", "completed").
    pub resolution_marker: bool,
    /// Action-confirmation pattern ("PO approved", "quote accepted", "shipped").
    pub action_completion: bool,
    /// Urgency keywords present.
    pub urgency_marker: bool,
    /// Escalation keywords present.
    pub escalation_marker: bool,
    /// Sender domain is on the customer allowlist.
    pub customer_sender: bool,
}

// ── Phase 1 ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase1Result {
    pub workflow_category: WorkflowCategory,
    pub priority: Priority,
    pub entities: EntitySet,
    pub signals: SignalFlags,
    pub confidence: f64,
    pub rules_version: String,
}

// ── Phase 2 ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowValidation {
    /// Whether the model agrees with the Phase 1 category.
    pub confirmed: bool,
    pub category: WorkflowCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    #[serde(default)]
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase2Result {
    pub workflow_validation: WorkflowValidation,
    #[serde(default)]
    pub missed_entities: EntitySet,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    pub risk_assessment: RiskAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
    pub confidence: f64,
}

// ── Phase 3 ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategicIntelligence {
    pub market_opportunity: String,
    pub operational_excellence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveAnalytics {
    /// Probability in [0,1] per outcome key (e.g. "deal_closes").
    #[serde(default)]
    pub outcome_probability: BTreeMap<String, f64>,
    pub forecasting: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase3Result {
    pub executive_summary: String,
    pub strategic_intelligence: StrategicIntelligence,
    pub predictive_analytics: PredictiveAnalytics,
    pub roi_analysis: String,
    pub confidence: f64,
}

// ── Tagged union stored per (email, phase) ──────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AnalysisResult {
    Phase1(Phase1Result),
    Phase2(Phase2Result),
    Phase3(Phase3Result),
}

impl AnalysisResult {
    pub fn phase_number(&self) -> i16 {
        match self {
            AnalysisResult::Phase1(_) => 1,
            AnalysisResult::Phase2(_) => 2,
            AnalysisResult::Phase3(_) => 3,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            AnalysisResult::Phase1(r) => r.confidence,
            AnalysisResult::Phase2(r) => r.confidence,
            AnalysisResult::Phase3(r) => r.confidence,
        }
    }

    /// Schema validation applied before persistence.
    pub fn validate(&self) -> Result<(), String> {
        let confidence = self.confidence();
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!("confidence {} outside [0,1]", confidence));
        }
        match self {
            AnalysisResult::Phase1(r) => {
                for m in r
                    .entities
                    .po_numbers
                    .iter()
                    .chain(&r.entities.quote_numbers)
                    .chain(&r.entities.case_numbers)
                    .chain(&r.entities.part_numbers)
                    .chain(&r.entities.money_amounts)
                    .chain(&r.entities.dates)
                    .chain(&r.entities.people)
                    .chain(&r.entities.organizations)
                {
                    if !(0.0..=1.0).contains(&m.confidence) {
                        return Err(format!(
                            "entity '{}' confidence {} outside [0,1]",
                            m.value, m.confidence
                        ));
                    }
                    if m.span_end < m.span_start {
                        return Err(format!("entity '{}' has inverted span", m.value));
                    }
                }
                if r.rules_version.is_empty() {
                    return Err("missing rules_version".to_string());
                }
                Ok(())
            }
            AnalysisResult::Phase2(_) => Ok(()),
            AnalysisResult::Phase3(r) => {
                if r.executive_summary.trim().is_empty() {
                    return Err("empty executive_summary".to_string());
                }
                for (key, p) in &r.predictive_analytics.outcome_probability {
                    if !(0.0..=1.0).contains(p) {
                        return Err(format!("outcome '{}' probability {} outside [0,1]", key, p));
                    }
                }
                Ok(())
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_ordering() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }

    #[test]
    fn legacy_urgent_maps_to_critical() {
        assert_eq!("urgent".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!("Urgent".parse::<Priority>().unwrap(), Priority::Critical);
    }

    #[test]
    fn promoted_stops_at_critical() {
        assert_eq!(Priority::Low.promoted(), Priority::Medium);
        assert_eq!(Priority::Medium.promoted(), Priority::High);
        assert_eq!(Priority::High.promoted(), Priority::Critical);
        assert_eq!(Priority::Critical.promoted(), Priority::Critical);
    }

    #[test]
    fn analysis_result_tagged_roundtrip() {
        let result = AnalysisResult::Phase1(Phase1Result {
            workflow_category: WorkflowCategory::OrderProcessing,
            priority: Priority::High,
            entities: EntitySet::default(),
            signals: SignalFlags::default(),
            confidence: 0.8,
            rules_version: "v1".to_string(),
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["phase"], "phase1");
        assert_eq!(json["workflow_category"], "order_processing");
        let back: AnalysisResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let result = AnalysisResult::Phase2(Phase2Result {
            workflow_validation: WorkflowValidation {
                confirmed: true,
                category: WorkflowCategory::General,
                reason: None,
            },
            missed_entities: EntitySet::default(),
            action_items: vec![],
            risk_assessment: RiskAssessment { level: RiskLevel::None, factors: vec![] },
            suggested_response: None,
            confidence: 1.3,
        });
        assert!(result.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_executive_summary() {
        let result = AnalysisResult::Phase3(Phase3Result {
            executive_summary: "  ".to_string(),
            strategic_intelligence: StrategicIntelligence {
                market_opportunity: String::new(),
                operational_excellence: String::new(),
            },
            predictive_analytics: PredictiveAnalytics {
                outcome_probability: BTreeMap::new(),
                forecasting: String::new(),
            },
            roi_analysis: String::new(),
            confidence: 0.5,
        });
        assert!(result.validate().is_err());
    }

    #[test]
    fn entity_absorb_is_additive_only() {
        let existing = EntityMatch {
            value: "12345678".to_string(),
            confidence: 0.95,
            span_start: 0,
            span_end: 8,
        };
        let mut set = EntitySet { po_numbers: vec![existing.clone()], ..Default::default() };

        let mut incoming = EntitySet::default();
        incoming.po_numbers.push(EntityMatch {
            value: "12345678".to_string(),
            confidence: 0.4,
            span_start: 10,
            span_end: 18,
        });
        incoming.po_numbers.push(EntityMatch {
            value: "99999999".to_string(),
            confidence: 0.7,
            span_start: 20,
            span_end: 28,
        });

        set.absorb(incoming);
        assert_eq!(set.po_numbers.len(), 2);
        // The pre-existing higher-confidence match is untouched.
        assert_eq!(set.po_numbers[0], existing);
    }
}
