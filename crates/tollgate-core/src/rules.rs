use crate::types::{TicketStatus, DECLARED_MERGE, DECLARED_QA};

// ---------------------------------------------------------------------------
// TicketSignals
// ---------------------------------------------------------------------------

/// Boolean facts about one ticket, distilled from every evidence source.
/// Rules only ever see these, never the raw artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketSignals {
    /// Trimmed, upper-cased backlog status; empty when the ticket states none.
    pub declared_status: String,
    pub malformed: bool,
    pub report_pass: bool,
    pub report_blocked: bool,
    pub qa_pass: bool,
    pub qa_fail: bool,
    pub merged: bool,
    pub manifest_ready: bool,
    pub ticket_gate_pass: bool,
    pub ticket_gate_blocked: bool,
}

impl TicketSignals {
    fn declared_in(&self, set: &[&str]) -> bool {
        set.contains(&self.declared_status.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

/// Base-status rule. The first rule whose condition holds decides the status.
pub struct StatusRule {
    pub id: &'static str,
    pub condition: fn(&TicketSignals) -> bool,
    pub status: TicketStatus,
}

/// Contradiction check, evaluated against the signals and the computed base status.
/// Every matching rule contributes one message.
pub struct ConflictRule {
    pub id: &'static str,
    pub condition: fn(&TicketSignals, TicketStatus) -> bool,
    pub message: fn(&TicketSignals, TicketStatus) -> String,
}

/// Status when no rule matches.
pub const FALLBACK_STATUS: TicketStatus = TicketStatus::InProgress;

// ---------------------------------------------------------------------------
// Base-status rules
// ---------------------------------------------------------------------------

pub fn default_status_rules() -> Vec<StatusRule> {
    vec![
        // 1. Missing required backlog metadata
        StatusRule {
            id: "malformed_metadata",
            condition: |s| s.malformed,
            status: TicketStatus::Blocked,
        },
        // 2. A MERGED decision outranks everything else
        StatusRule {
            id: "merge_decision_merged",
            condition: |s| s.merged,
            status: TicketStatus::Merged,
        },
        // 3. Any blocking evidence
        StatusRule {
            id: "blocking_evidence",
            condition: |s| s.report_blocked || s.qa_fail || s.ticket_gate_blocked,
            status: TicketStatus::Blocked,
        },
        // 4. QA, ticket gate, and manifest all agree
        StatusRule {
            id: "merge_ready_evidence",
            condition: |s| s.qa_pass && s.ticket_gate_pass && s.manifest_ready,
            status: TicketStatus::ReadyForMerge,
        },
        // 5. Report done, QA pending
        StatusRule {
            id: "report_awaiting_qa",
            condition: |s| s.report_pass && !s.qa_pass,
            status: TicketStatus::ReadyForQa,
        },
        StatusRule {
            id: "declared_ready_for_qa",
            condition: |s| s.declared_in(DECLARED_QA),
            status: TicketStatus::ReadyForQa,
        },
        StatusRule {
            id: "declared_blocked",
            condition: |s| s.declared_status == "BLOCKED",
            status: TicketStatus::Blocked,
        },
    ]
}

// ---------------------------------------------------------------------------
// Conflict rules
// ---------------------------------------------------------------------------

pub fn default_conflict_rules() -> Vec<ConflictRule> {
    vec![
        ConflictRule {
            id: "report_pass_vs_blocked",
            condition: |s, _| s.report_pass && (s.qa_fail || s.ticket_gate_blocked),
            message: |_, _| "report indicates PASS while QA/gate indicates BLOCKED".to_string(),
        },
        ConflictRule {
            id: "qa_pass_vs_ticket_gate",
            condition: |s, _| s.qa_pass && s.ticket_gate_blocked,
            message: |_, _| "QA PASS conflicts with latest ticket gate BLOCKED".to_string(),
        },
        // Declared status ahead of the evidence
        ConflictRule {
            id: "declared_merge_ahead",
            condition: |s, base| s.declared_in(DECLARED_MERGE) && base.is_pre_merge(),
            message: |s, base| {
                format!(
                    "declared_status={} is ahead of evidence_state={base}",
                    s.declared_status
                )
            },
        },
        ConflictRule {
            id: "declared_merged_without_evidence",
            condition: |s, base| s.declared_status == "MERGED" && base != TicketStatus::Merged,
            message: |_, _| "declared_status=MERGED but merge evidence is missing".to_string(),
        },
        // Blocked declaration contradicted by passing evidence
        ConflictRule {
            id: "declared_blocked_vs_progress",
            condition: |s, base| s.declared_status == "BLOCKED" && base.is_evidence_backed_progress(),
            message: |_, base| format!("declared_status=BLOCKED conflicts with evidence_state={base}"),
        },
    ]
}
