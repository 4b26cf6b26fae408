//! Readiness reconciliation: one effective status per backlog ticket.
//!
//! Each ticket's evidence is reduced to [`TicketSignals`], run through the
//! ordered base-status rules (first match wins) and then through every
//! conflict rule. Any conflict demotes the ticket to `STALE_METADATA`.

use crate::artifact::{ArtifactReader, MarkdownReader};
use crate::error::{Result, TollgateError};
use crate::evidence::{EvidenceRecord, EvidenceSet};
use crate::io::write_json_pretty;
use crate::paths;
use crate::rules::{
    default_conflict_rules, default_status_rules, ConflictRule, StatusRule, TicketSignals,
    FALLBACK_STATUS,
};
use crate::types::{is_blocked, is_pass, is_yes, to_status, TicketStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Backlog keys whose absence makes a ticket malformed.
pub const REQUIRED_BACKLOG_KEYS: &[&str] = &["status", "owner_agent", "execution_lane", "critical_path"];

// ---------------------------------------------------------------------------
// TicketRow / Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRow {
    pub ticket_id: String,
    pub owner_agent: String,
    /// `YES` or `NO`.
    pub critical_path: String,
    pub declared_status: String,
    pub effective_status: TicketStatus,
    pub base_effective_status: TicketStatus,
    pub lane: String,
    pub latest_report_path: Option<String>,
    pub qa_signoff_path: Option<String>,
    pub merge_manifest_path: Option<String>,
    pub latest_gate_job_id: Option<String>,
    pub evidence: Vec<String>,
    pub conflicts: Vec<String>,
    pub last_activity_date: Option<DateTime<Utc>>,
}

impl TicketRow {
    pub fn is_critical(&self) -> bool {
        self.critical_path == "YES"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub source_root: String,
    pub tickets: Vec<TicketRow>,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TollgateError::SnapshotNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_pretty(path, self)
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    status_rules: Vec<StatusRule>,
    conflict_rules: Vec<ConflictRule>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(default_status_rules(), default_conflict_rules())
    }
}

impl Reconciler {
    pub fn new(status_rules: Vec<StatusRule>, conflict_rules: Vec<ConflictRule>) -> Self {
        Self {
            status_rules,
            conflict_rules,
        }
    }

    pub fn base_status(&self, signals: &TicketSignals) -> TicketStatus {
        for rule in &self.status_rules {
            if (rule.condition)(signals) {
                tracing::debug!(rule = rule.id, status = %rule.status, "base status rule matched");
                return rule.status;
            }
        }
        FALLBACK_STATUS
    }

    pub fn conflicts(&self, signals: &TicketSignals, base: TicketStatus) -> Vec<String> {
        self.conflict_rules
            .iter()
            .filter(|rule| (rule.condition)(signals, base))
            .map(|rule| (rule.message)(signals, base))
            .collect()
    }

    /// Rows for every backlog ticket, in ticket-id order.
    pub fn reconcile_all(&self, evidence: &EvidenceSet) -> Vec<TicketRow> {
        evidence
            .backlog
            .values()
            .map(|backlog| self.reconcile_ticket(backlog, evidence))
            .collect()
    }

    pub fn reconcile_ticket(&self, backlog: &EvidenceRecord, evidence: &EvidenceSet) -> TicketRow {
        let ticket_id = backlog.ticket_id.as_str();
        let declared_status = to_status(backlog.get("status"));
        let owner_agent = non_empty(backlog.get("owner_agent")).unwrap_or("unassigned");
        let critical = to_status(backlog.get("critical_path")) == "YES";
        let lane = non_empty(backlog.get("execution_lane"))
            .unwrap_or("LOCAL")
            .to_uppercase();

        let mut signals = TicketSignals {
            declared_status: declared_status.clone(),
            ..Default::default()
        };
        let mut trail = vec![format!("declared_status={}", or_unknown(&declared_status))];
        let mut activity = vec![backlog.timestamp];

        let missing: Vec<&str> = REQUIRED_BACKLOG_KEYS
            .iter()
            .copied()
            .filter(|key| non_empty(backlog.get(key)).is_none())
            .collect();
        if !missing.is_empty() {
            signals.malformed = true;
            trail.push(format!("metadata_missing={}", missing.join(",")));
        }

        let report = evidence.reports.get(ticket_id);
        if let Some(report) = report {
            let status = to_status(report.get("status"));
            signals.report_pass = is_pass(&status);
            signals.report_blocked = is_blocked(&status);
            trail.push(format!("report_status={}", or_unknown(&status)));
            activity.push(report.timestamp);
        }

        let qa = evidence.qa.get(ticket_id);
        if let Some(qa) = qa {
            let result = to_status(qa.get("gate_result"));
            signals.qa_pass = result == "PASS";
            signals.qa_fail = is_blocked(&result);
            trail.push(format!("qa_result={}", or_unknown(&result)));
            activity.push(qa.timestamp);
        }

        let manifest = evidence.merge.get(ticket_id);
        let mut manifest_gate_status = String::new();
        if let Some(manifest) = manifest {
            let decision = to_status(manifest.get("merge_decision"));
            manifest_gate_status = to_status(manifest.get("gate_status"));
            signals.merged = decision == "MERGED";
            signals.manifest_ready = is_yes(manifest.get("ready_for_merge_to_main_now"))
                || is_yes(manifest.get("ready_for_pr_creation"))
                || is_pass(&manifest_gate_status);
            trail.push("merge_manifest_present=YES".to_string());
            if !decision.is_empty() {
                trail.push(format!("merge_decision={decision}"));
            }
            activity.push(manifest.timestamp);
        }

        let latest_gate = evidence.gates.latest.get(ticket_id);
        if let Some(gate) = latest_gate {
            activity.push(gate.timestamp);
        }
        let ticket_gate_status = match evidence.gates.latest_ticket_mode.get(ticket_id) {
            Some(gate) => {
                let status = to_status(gate.get("status"));
                trail.push(format!("ticket_gate_status={}", or_unknown(&status)));
                Some(status)
            }
            None if !manifest_gate_status.is_empty() => {
                trail.push(format!("manifest_gate_status={manifest_gate_status}"));
                Some(manifest_gate_status)
            }
            None => None,
        };
        if let Some(status) = ticket_gate_status {
            signals.ticket_gate_pass = is_pass(&status);
            signals.ticket_gate_blocked = is_blocked(&status);
        }

        let base = self.base_status(&signals);
        let conflicts = self.conflicts(&signals, base);
        let effective = if conflicts.is_empty() {
            base
        } else {
            trail.push(format!("conflict_count={}", conflicts.len()));
            TicketStatus::StaleMetadata
        };

        TicketRow {
            ticket_id: ticket_id.to_string(),
            owner_agent: owner_agent.to_string(),
            critical_path: if critical { "YES" } else { "NO" }.to_string(),
            declared_status: or_unknown(&declared_status).to_string(),
            effective_status: effective,
            base_effective_status: base,
            lane,
            latest_report_path: report.map(|r| r.path.display().to_string()),
            qa_signoff_path: qa.map(|r| r.path.display().to_string()),
            merge_manifest_path: manifest.map(|r| r.path.display().to_string()),
            latest_gate_job_id: latest_gate
                .and_then(|g| non_empty(g.get("job_id")))
                .map(str::to_string),
            evidence: trail,
            conflicts,
            last_activity_date: activity.into_iter().max(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn or_unknown(status: &str) -> &str {
    if status.is_empty() {
        "UNKNOWN"
    } else {
        status
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| TollgateError::InvalidDate(raw.to_string()))
}

/// Reconcile the tree under `root` and write the snapshot for `date`.
pub fn reconcile(root: &Path, date: NaiveDate) -> Result<(PathBuf, Vec<TicketRow>)> {
    reconcile_with(root, date, &MarkdownReader)
}

pub fn reconcile_with<R: ArtifactReader>(
    root: &Path,
    date: NaiveDate,
    reader: &R,
) -> Result<(PathBuf, Vec<TicketRow>)> {
    let evidence = EvidenceSet::load(root, reader)?;
    let rows = Reconciler::default().reconcile_all(&evidence);

    let snapshot = Snapshot {
        generated_at: Utc::now(),
        source_root: root.display().to_string(),
        tickets: rows,
    };
    let path = paths::snapshot_path(root, date);
    snapshot.save(&path)?;
    tracing::info!(
        tickets = snapshot.tickets.len(),
        path = %path.display(),
        "readiness snapshot written"
    );
    Ok((path, snapshot.tickets))
}

/// Row count per effective status, in status-name order.
pub fn status_counts(rows: &[TicketRow]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        *counts.entry(row.effective_status.to_string()).or_insert(0) += 1;
    }
    counts
}

pub fn summary_line(rows: &[TicketRow], snapshot: &Path) -> String {
    let mut line = format!("summary total={}", rows.len());
    for (status, count) in status_counts(rows) {
        line.push_str(&format!(" {status}={count}"));
    }
    line.push_str(&format!(" snapshot={}", snapshot.display()));
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write;
    use tempfile::TempDir;

    fn backlog(root: &Path, id: &str, status: &str) {
        write(
            root,
            &format!("agents/backlog/{id}.md"),
            &format!(
                "# {id}\n\n## Metadata\n- Ticket ID: {id}\n- Status: {status}\n- Owner Agent: agent1\n- Execution Lane: local\n- Critical Path: YES\n- Date: 2026-02-01\n"
            ),
        );
    }

    fn report(root: &Path, id: &str, status: &str) {
        write(
            root,
            &format!("agents/reports/agent1/{id}_report.md"),
            &format!("## Metadata\n- Ticket ID: {id}\n- Status: {status}\n- Report Date: 2026-02-17\n"),
        );
    }

    fn qa(root: &Path, id: &str, result: &str) {
        write(
            root,
            &format!("agents/qa/{id}_qa.md"),
            &format!("## Metadata\n- Ticket ID: {id}\n- Gate Result: {result}\n- Date: 2026-02-17\n"),
        );
    }

    fn manifest(root: &Path, id: &str, body: &str) {
        write(
            root,
            &format!("agents/merge/{id}_manifest.md"),
            &format!("## Metadata\n- Ticket ID: {id}\n{body}"),
        );
    }

    fn gate(root: &Path, job: &str, id: &str, mode: &str, status: &str, finished: &str) {
        write(
            root,
            &format!("agents/status/gates/queue/history/{job}.json"),
            &format!(
                r#"{{"job_id":"{job}","ticket_id":"{id}","mode":"{mode}","status":"{status}","finished_at":"{finished}"}}"#
            ),
        );
    }

    fn rows(root: &Path) -> Vec<TicketRow> {
        let evidence = EvidenceSet::load(root, &MarkdownReader).unwrap();
        Reconciler::default().reconcile_all(&evidence)
    }

    fn row<'a>(rows: &'a [TicketRow], id: &str) -> &'a TicketRow {
        rows.iter().find(|r| r.ticket_id == id).unwrap()
    }

    #[test]
    fn full_evidence_reaches_ready_for_merge() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "NB-T2", "IN_PROGRESS");
        report(root, "NB-T2", "PASS");
        qa(root, "NB-T2", "PASS");
        manifest(root, "NB-T2", "- Gate Status: PASS\n- Ready for merge to main now: YES\n");
        gate(root, "J1", "NB-T2", "TICKET", "PASS", "2026-02-17T12:00:00+00:00");

        let rows = rows(root);
        let r = row(&rows, "NB-T2");
        assert_eq!(r.effective_status, TicketStatus::ReadyForMerge);
        assert_eq!(r.base_effective_status, TicketStatus::ReadyForMerge);
        assert!(r.conflicts.is_empty());
        assert_eq!(r.latest_gate_job_id.as_deref(), Some("J1"));
        assert_eq!(
            r.evidence,
            vec![
                "declared_status=IN_PROGRESS",
                "report_status=PASS",
                "qa_result=PASS",
                "merge_manifest_present=YES",
                "ticket_gate_status=PASS",
            ]
        );
        assert_eq!(r.lane, "LOCAL");
        assert!(r.is_critical());
    }

    #[test]
    fn report_pass_without_qa_is_never_merge_ready() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "NB-T1", "IN_PROGRESS");
        report(root, "NB-T1", "PASS");
        manifest(root, "NB-T1", "- Gate Status: PASS\n- Ready for merge to main now: YES\n");

        let rows = rows(root);
        assert_eq!(row(&rows, "NB-T1").effective_status, TicketStatus::ReadyForQa);
    }

    #[test]
    fn merged_decision_always_wins() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "NB-T3", "MERGED");
        report(root, "NB-T3", "BLOCKED");
        manifest(root, "NB-T3", "- Merge Decision: merged\n");

        let rows = rows(root);
        let r = row(&rows, "NB-T3");
        assert_eq!(r.effective_status, TicketStatus::Merged);
        assert!(r.evidence.contains(&"merge_decision=MERGED".to_string()));
    }

    #[test]
    fn missing_backlog_fields_block_with_trail() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            "agents/backlog/NB-T4.md",
            "## Metadata\n- Ticket ID: NB-T4\n- Status: READY_FOR_QA\n",
        );

        let rows = rows(root);
        let r = row(&rows, "NB-T4");
        assert_eq!(r.effective_status, TicketStatus::Blocked);
        assert!(r
            .evidence
            .contains(&"metadata_missing=owner_agent,execution_lane,critical_path".to_string()));
        assert_eq!(r.owner_agent, "unassigned");
        assert_eq!(r.critical_path, "NO");
    }

    #[test]
    fn contradicting_evidence_is_stale() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "NB-T5", "IN_PROGRESS");
        report(root, "NB-T5", "PASS");
        qa(root, "NB-T5", "FAIL");

        let rows = rows(root);
        let r = row(&rows, "NB-T5");
        assert_eq!(r.base_effective_status, TicketStatus::Blocked);
        assert_eq!(r.effective_status, TicketStatus::StaleMetadata);
        assert_eq!(r.conflicts.len(), 1);
        assert_eq!(r.evidence.last().map(String::as_str), Some("conflict_count=1"));
    }

    #[test]
    fn manifest_gate_status_used_without_ticket_history() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "NB-T6", "IN_PROGRESS");
        qa(root, "NB-T6", "PASS");
        manifest(root, "NB-T6", "- Gate Status: PASS\n- Date: 2026-02-10\n");
        // MERGE-mode history does not count as ticket gate evidence.
        gate(root, "J9", "NB-T6", "MERGE", "FAIL", "2026-02-18T00:00:00+00:00");

        let rows = rows(root);
        let r = row(&rows, "NB-T6");
        assert!(r.evidence.contains(&"manifest_gate_status=PASS".to_string()));
        assert_eq!(r.effective_status, TicketStatus::ReadyForMerge);
        assert_eq!(r.latest_gate_job_id.as_deref(), Some("J9"));
        assert_eq!(
            r.last_activity_date.unwrap().to_rfc3339(),
            "2026-02-18T00:00:00+00:00"
        );
    }

    #[test]
    fn no_conflicts_means_effective_equals_base() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "A-1", "IN_PROGRESS");
        backlog(root, "A-2", "READY_FOR_QA");
        backlog(root, "A-3", "BLOCKED");
        report(root, "A-2", "PASS");

        for r in rows(root) {
            if r.conflicts.is_empty() {
                assert_eq!(r.effective_status, r.base_effective_status);
            }
        }
    }

    #[test]
    fn reconcile_is_idempotent_and_sorted() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "NB-T9", "IN_PROGRESS");
        backlog(root, "NB-T1", "READY_FOR_MERGE");
        report(root, "NB-T1", "PASS");
        let date = parse_date("2026-02-17").unwrap();

        let (path_a, rows_a) = reconcile(root, date).unwrap();
        let (path_b, rows_b) = reconcile(root, date).unwrap();
        assert_eq!(path_a, path_b);
        assert_eq!(rows_a, rows_b);
        assert_eq!(rows_a[0].ticket_id, "NB-T1");
        assert!(path_a.ends_with("agents/status/release/readiness_snapshot_2026-02-17.json"));

        let snapshot = Snapshot::load(&path_a).unwrap();
        assert_eq!(snapshot.tickets, rows_a);
    }

    #[test]
    fn empty_tree_gives_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let date = parse_date("2026-02-17").unwrap();
        let (path, rows) = reconcile(dir.path(), date).unwrap();
        assert!(rows.is_empty());
        assert!(path.exists());
        assert_eq!(
            summary_line(&rows, &path),
            format!("summary total=0 snapshot={}", path.display())
        );
    }

    #[test]
    fn summary_counts_by_status() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        backlog(root, "A-1", "IN_PROGRESS");
        backlog(root, "A-2", "BLOCKED");
        backlog(root, "A-3", "IN_PROGRESS");
        let rows = rows(root);
        let line = summary_line(&rows, Path::new("snap.json"));
        assert_eq!(line, "summary total=3 BLOCKED=1 IN_PROGRESS=2 snapshot=snap.json");
    }

    #[test]
    fn bad_date_is_rejected() {
        assert!(matches!(parse_date("17/02/2026"), Err(TollgateError::InvalidDate(_))));
    }
}
