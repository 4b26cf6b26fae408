use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Status vocabulary used by evidence artifacts
// ---------------------------------------------------------------------------

pub const PASS_STATUSES: &[&str] = &["PASS", "DONE", "COMPLETED", "SUCCESS", "WAIVED_BASELINE"];
pub const BLOCKED_STATUSES: &[&str] = &[
    "FAIL",
    "FAILED",
    "BLOCKED",
    "ERROR",
    "INTERRUPTED",
    "UNHEALTHY",
];
pub const DECLARED_QA: &[&str] = &["READY_FOR_QA"];
pub const DECLARED_MERGE: &[&str] = &["READY_TO_MERGE", "READY_FOR_MERGE"];

/// Canonical form of a free-text status: trimmed and upper-cased.
pub fn to_status(raw: Option<&str>) -> String {
    raw.unwrap_or_default().trim().to_uppercase()
}

pub fn is_pass(status: &str) -> bool {
    PASS_STATUSES.contains(&status)
}

pub fn is_blocked(status: &str) -> bool {
    BLOCKED_STATUSES.contains(&status)
}

/// `YES`, `yes`, and `YES (pending review)` all count.
pub fn is_yes(raw: Option<&str>) -> bool {
    to_status(raw).starts_with("YES")
}

// ---------------------------------------------------------------------------
// TicketStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    InProgress,
    ReadyForQa,
    ReadyForMerge,
    Merged,
    Blocked,
    StaleMetadata,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::ReadyForQa => "READY_FOR_QA",
            TicketStatus::ReadyForMerge => "READY_FOR_MERGE",
            TicketStatus::Merged => "MERGED",
            TicketStatus::Blocked => "BLOCKED",
            TicketStatus::StaleMetadata => "STALE_METADATA",
        }
    }

    /// True for statuses reached only on passing evidence (QA-ready and beyond).
    pub fn is_evidence_backed_progress(self) -> bool {
        match self {
            TicketStatus::ReadyForQa | TicketStatus::ReadyForMerge | TicketStatus::Merged => true,
            TicketStatus::InProgress | TicketStatus::Blocked | TicketStatus::StaleMetadata => {
                false
            }
        }
    }

    /// True while the work has not yet earned a merge-tier status.
    pub fn is_pre_merge(self) -> bool {
        match self {
            TicketStatus::InProgress | TicketStatus::ReadyForQa => true,
            TicketStatus::ReadyForMerge
            | TicketStatus::Merged
            | TicketStatus::Blocked
            | TicketStatus::StaleMetadata => false,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GateMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateMode {
    Ticket,
    Merge,
}

impl GateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GateMode::Ticket => "TICKET",
            GateMode::Merge => "MERGE",
        }
    }
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GateMode {
    type Err = crate::error::TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "TICKET" => Ok(GateMode::Ticket),
            "MERGE" => Ok(GateMode::Merge),
            _ => Err(crate::error::TollgateError::UnsupportedMode(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Pass,
    WaivedBaseline,
    Fail,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Pass => "PASS",
            JobStatus::WaivedBaseline => "WAIVED_BASELINE",
            JobStatus::Fail => "FAIL",
            JobStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            JobStatus::Pass | JobStatus::WaivedBaseline | JobStatus::Fail | JobStatus::Interrupted => {
                true
            }
            JobStatus::Queued | JobStatus::Running => false,
        }
    }

    /// PASS and WAIVED_BASELINE both let a merge proceed.
    pub fn is_passing(self) -> bool {
        matches!(self, JobStatus::Pass | JobStatus::WaivedBaseline)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pass,
    Fail,
    WaivedBaseline,
    Interrupted,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pass => "PASS",
            StepStatus::Fail => "FAIL",
            StepStatus::WaivedBaseline => "WAIVED_BASELINE",
            StepStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_vocabulary_is_case_insensitive_via_to_status() {
        assert!(is_pass(&to_status(Some(" pass "))));
        assert!(is_pass(&to_status(Some("waived_baseline"))));
        assert!(is_blocked(&to_status(Some("Interrupted"))));
        assert!(!is_pass(&to_status(None)));
        assert!(!is_blocked(""));
    }

    #[test]
    fn yes_prefix_matches() {
        assert!(is_yes(Some("YES")));
        assert!(is_yes(Some("yes - after rebase")));
        assert!(!is_yes(Some("NO")));
        assert!(!is_yes(None));
    }

    #[test]
    fn gate_mode_parses_either_case() {
        assert_eq!(GateMode::from_str("ticket").unwrap(), GateMode::Ticket);
        assert_eq!(GateMode::from_str("MERGE").unwrap(), GateMode::Merge);
        assert!(matches!(
            GateMode::from_str("deploy"),
            Err(crate::error::TollgateError::UnsupportedMode(_))
        ));
    }

    #[test]
    fn job_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&JobStatus::WaivedBaseline).unwrap();
        assert_eq!(json, "\"WAIVED_BASELINE\"");
        let parsed: JobStatus = serde_json::from_str("\"INTERRUPTED\"").unwrap();
        assert_eq!(parsed, JobStatus::Interrupted);
    }

    #[test]
    fn terminal_job_statuses() {
        assert!(JobStatus::Interrupted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::WaivedBaseline.is_passing());
        assert!(!JobStatus::Fail.is_passing());
    }

    #[test]
    fn ticket_status_tiers() {
        assert!(TicketStatus::Merged.is_evidence_backed_progress());
        assert!(!TicketStatus::InProgress.is_evidence_backed_progress());
        assert!(TicketStatus::ReadyForQa.is_pre_merge());
        assert!(!TicketStatus::ReadyForMerge.is_pre_merge());
        assert_eq!(TicketStatus::StaleMetadata.to_string(), "STALE_METADATA");
    }
}
