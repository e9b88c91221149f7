//! Persisted job records for the three-phase queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::Priority;

/// Pipeline phase. Also names the queue stream a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Phase1,
    Phase2,
    Phase3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Phase1, Phase::Phase2, Phase::Phase3];

    pub fn number(&self) -> i16 {
        match self {
            Phase::Phase1 => 1,
            Phase::Phase2 => 2,
            Phase::Phase3 => 3,
        }
    }

    pub fn from_number(n: i16) -> Option<Self> {
        match n {
            1 => Some(Phase::Phase1),
            2 => Some(Phase::Phase2),
            3 => Some(Phase::Phase3),
            _ => None,
        }
    }

    /// Queue stream name.
    pub fn stream(&self) -> &'static str {
        match self {
            Phase::Phase1 => "phase1",
            Phase::Phase2 => "phase2",
            Phase::Phase3 => "phase3",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Phase1 => Some(Phase::Phase2),
            Phase::Phase2 => Some(Phase::Phase3),
            Phase::Phase3 => None,
        }
    }

    pub fn from_stream(s: &str) -> Option<Self> {
        match s {
            "phase1" => Some(Phase::Phase1),
            "phase2" => Some(Phase::Phase2),
            "phase3" => Some(Phase::Phase3),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream())
    }
}

/// A unit of work leased by one worker at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub phase: Phase,
    pub email_ids: Vec<Uuid>,
    pub priority: Priority,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub idempotency_key: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Build a job for a single email. The idempotency key ties the phase to
    /// the email so redundant enqueues within the dedup window are no-ops.
    pub fn for_email(phase: Phase, email_id: Uuid, priority: Priority, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            phase,
            email_ids: vec![email_id],
            priority,
            attempts: 0,
            enqueued_at: now,
            not_before: now,
            idempotency_key: format!("{}:{}", phase.stream(), email_id),
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_chaining() {
        assert_eq!(Phase::Phase1.next(), Some(Phase::Phase2));
        assert_eq!(Phase::Phase2.next(), Some(Phase::Phase3));
        assert_eq!(Phase::Phase3.next(), None);
    }

    #[test]
    fn stream_names_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_stream(phase.stream()), Some(phase));
        }
        assert_eq!(Phase::from_stream("dls"), None);
    }

    #[test]
    fn job_serde_accepts_legacy_urgent_priority() {
        let json = r#"{
            "job_id": "j1",
            "phase": "phase2",
            "email_ids": ["7c8a1f8e-26a6-4e4c-b0cd-dc2f9dbe8f1a"],
            "priority": "high",
            "attempts": 2,
            "enqueued_at": "2025-06-01T12:00:00Z",
            "not_before": "2025-06-01T12:05:00Z",
            "idempotency_key": "phase2:7c8a1f8e-26a6-4e4c-b0cd-dc2f9dbe8f1a"
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.phase, Phase::Phase2);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn idempotency_key_is_stable_per_email_and_phase() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let a = Job::for_email(Phase::Phase1, id, Priority::Medium, now);
        let b = Job::for_email(Phase::Phase1, id, Priority::High, now);
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.job_id, b.job_id);
    }
}
