//! Processing status state machine and the outward UI projection.
//!
//! The transition table lives here and is enforced by the store on every
//! status update. The UI status is a projection computed on read; it is
//! never persisted, and this module is the only place the mapping exists.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Pending,
    Phase1Complete,
    Phase2Complete,
    Phase3Complete,
    Phase2Failed,
    Phase3Failed,
    Archived,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 7] = [
        EmailStatus::Pending,
        EmailStatus::Phase1Complete,
        EmailStatus::Phase2Complete,
        EmailStatus::Phase3Complete,
        EmailStatus::Phase2Failed,
        EmailStatus::Phase3Failed,
        EmailStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Phase1Complete => "phase1_complete",
            EmailStatus::Phase2Complete => "phase2_complete",
            EmailStatus::Phase3Complete => "phase3_complete",
            EmailStatus::Phase2Failed => "phase2_failed",
            EmailStatus::Phase3Failed => "phase3_failed",
            EmailStatus::Archived => "archived",
        }
    }

    /// The phase count this status implies at minimum.
    pub fn implied_phase(&self) -> i16 {
        match self {
            EmailStatus::Pending => 0,
            EmailStatus::Phase1Complete | EmailStatus::Phase2Failed => 1,
            EmailStatus::Phase2Complete | EmailStatus::Phase3Failed => 2,
            EmailStatus::Phase3Complete => 3,
            EmailStatus::Archived => 0,
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmailStatus::Pending),
            "phase1_complete" => Ok(EmailStatus::Phase1Complete),
            "phase2_complete" => Ok(EmailStatus::Phase2Complete),
            "phase3_complete" => Ok(EmailStatus::Phase3Complete),
            "phase2_failed" => Ok(EmailStatus::Phase2Failed),
            "phase3_failed" => Ok(EmailStatus::Phase3Failed),
            "archived" => Ok(EmailStatus::Archived),
            other => Err(format!("unknown email status '{}'", other)),
        }
    }
}

/// Allowed transitions:
///
/// ```text
/// pending         -> phase1_complete
/// phase1_complete -> phase2_complete | phase2_failed
/// phase2_complete -> phase3_complete | phase3_failed
/// phase2_failed   -> phase2_complete          (retry/backfill)
/// phase3_failed   -> phase3_complete          (retry/backfill)
/// any             -> archived                 (retention)
/// ```
pub fn is_valid_transition(from: EmailStatus, to: EmailStatus) -> bool {
    use EmailStatus::*;
    if to == Archived {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Phase1Complete)
            | (Phase1Complete, Phase2Complete)
            | (Phase1Complete, Phase2Failed)
            | (Phase2Complete, Phase3Complete)
            | (Phase2Complete, Phase3Failed)
            | (Phase2Failed, Phase2Complete)
            | (Phase3Failed, Phase3Complete)
    )
}

// ── UI projection ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiStatus {
    Resolved,
    Unread,
    Processing,
    Escalated,
    Read,
}

impl UiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UiStatus::Resolved => "resolved",
            UiStatus::Unread => "unread",
            UiStatus::Processing => "processing",
            UiStatus::Escalated => "escalated",
            UiStatus::Read => "read",
        }
    }
}

/// Total projection from internal status to the status the dashboard shows.
pub fn ui_status(status: EmailStatus) -> UiStatus {
    match status {
        EmailStatus::Phase2Complete | EmailStatus::Phase3Complete => UiStatus::Resolved,
        EmailStatus::Pending => UiStatus::Unread,
        EmailStatus::Phase1Complete => UiStatus::Processing,
        EmailStatus::Phase2Failed | EmailStatus::Phase3Failed => UiStatus::Escalated,
        EmailStatus::Archived => UiStatus::Read,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        assert!(is_valid_transition(EmailStatus::Pending, EmailStatus::Phase1Complete));
        assert!(is_valid_transition(EmailStatus::Phase1Complete, EmailStatus::Phase2Complete));
        assert!(is_valid_transition(EmailStatus::Phase2Complete, EmailStatus::Phase3Complete));
    }

    #[test]
    fn failure_and_retry_transitions() {
        assert!(is_valid_transition(EmailStatus::Phase1Complete, EmailStatus::Phase2Failed));
        assert!(is_valid_transition(EmailStatus::Phase2Failed, EmailStatus::Phase2Complete));
        assert!(is_valid_transition(EmailStatus::Phase2Complete, EmailStatus::Phase3Failed));
        assert!(is_valid_transition(EmailStatus::Phase3Failed, EmailStatus::Phase3Complete));
    }

    #[test]
    fn no_skipping_or_regressing() {
        assert!(!is_valid_transition(EmailStatus::Pending, EmailStatus::Phase2Complete));
        assert!(!is_valid_transition(EmailStatus::Pending, EmailStatus::Phase3Complete));
        assert!(!is_valid_transition(EmailStatus::Phase2Complete, EmailStatus::Phase1Complete));
        assert!(!is_valid_transition(EmailStatus::Phase3Complete, EmailStatus::Pending));
        assert!(!is_valid_transition(EmailStatus::Phase1Complete, EmailStatus::Phase3Complete));
    }

    #[test]
    fn any_status_can_archive() {
        for status in EmailStatus::ALL {
            assert!(is_valid_transition(status, EmailStatus::Archived));
        }
    }

    #[test]
    fn ui_projection_is_total() {
        // Exercising every variant: the match in ui_status has no wildcard,
        // so a new status without a projection fails to compile.
        assert_eq!(ui_status(EmailStatus::Pending), UiStatus::Unread);
        assert_eq!(ui_status(EmailStatus::Phase1Complete), UiStatus::Processing);
        assert_eq!(ui_status(EmailStatus::Phase2Complete), UiStatus::Resolved);
        assert_eq!(ui_status(EmailStatus::Phase3Complete), UiStatus::Resolved);
        assert_eq!(ui_status(EmailStatus::Phase2Failed), UiStatus::Escalated);
        assert_eq!(ui_status(EmailStatus::Phase3Failed), UiStatus::Escalated);
        assert_eq!(ui_status(EmailStatus::Archived), UiStatus::Read);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in EmailStatus::ALL {
            assert_eq!(status.as_str().parse::<EmailStatus>().unwrap(), status);
        }
    }
}
