//! Enqueue MERGE gate jobs for tickets the readiness snapshot marks READY_FOR_MERGE.
//!
//! Priority is applied here, when choosing what to enqueue. The queue itself
//! stays strictly FIFO.

use crate::driver::{EnqueueRequest, QueueDriver};
use crate::error::{Result, TollgateError};
use crate::paths;
use crate::readiness::{reconcile, Snapshot, TicketRow};
use crate::types::{GateMode, JobStatus, TicketStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MergeReadyOptions {
    pub date: NaiveDate,
    /// Use this snapshot instead of the dated one.
    pub snapshot: Option<PathBuf>,
    /// Read the existing dated snapshot instead of reconciling first.
    pub skip_refresh: bool,
    pub workdir: PathBuf,
    /// Stop after this many enqueues; 0 means no limit.
    pub max: usize,
    pub dry_run: bool,
    pub requeue_passed: bool,
    pub skip_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedTicket {
    pub ticket_id: String,
    /// `None` on a dry run.
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTicket {
    pub ticket_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReadyReport {
    pub snapshot: PathBuf,
    pub dry_run: bool,
    pub candidates: usize,
    pub queued: Vec<QueuedTicket>,
    pub skipped: Vec<SkippedTicket>,
}

impl MergeReadyReport {
    pub fn summary_line(&self) -> String {
        format!(
            "queue_merge_ready snapshot={} candidates={} queued={} skipped={}",
            self.snapshot.display(),
            self.candidates,
            self.queued.len(),
            self.skipped.len()
        )
    }
}

/// READY_FOR_MERGE rows, critical path first, then least recently active,
/// then ticket id. Rows without activity sort last within their tier.
pub fn merge_candidates(rows: &[TicketRow]) -> Vec<&TicketRow> {
    let mut candidates: Vec<&TicketRow> = rows
        .iter()
        .filter(|r| r.effective_status == TicketStatus::ReadyForMerge)
        .filter(|r| !r.ticket_id.trim().is_empty())
        .collect();
    candidates.sort_by_key(|r| {
        (
            !r.is_critical(),
            r.last_activity_date.unwrap_or(DateTime::<Utc>::MAX_UTC),
            r.ticket_id.clone(),
        )
    });
    candidates
}

fn resolve_snapshot(root: &Path, opts: &MergeReadyOptions) -> Result<PathBuf> {
    if let Some(path) = &opts.snapshot {
        if !path.exists() {
            return Err(TollgateError::SnapshotNotFound(path.clone()));
        }
        return Ok(path.clone());
    }
    if opts.skip_refresh {
        let path = paths::snapshot_path(root, opts.date);
        if !path.exists() {
            return Err(TollgateError::SnapshotNotFound(path));
        }
        return Ok(path);
    }
    let (path, _) = reconcile(root, opts.date)?;
    Ok(path)
}

pub fn queue_merge_ready(
    root: &Path,
    driver: &QueueDriver,
    opts: &MergeReadyOptions,
) -> Result<MergeReadyReport> {
    let snapshot_path = resolve_snapshot(root, opts)?;
    let snapshot = Snapshot::load(&snapshot_path)?;
    let candidates = merge_candidates(&snapshot.tickets);

    let store = driver.store();
    let mut in_flight: BTreeSet<String> = store
        .pending()?
        .into_iter()
        .filter(|job| job.mode == GateMode::Merge)
        .map(|job| job.ticket_id)
        .collect();
    if let Some(running) = store.running()? {
        if running.mode == GateMode::Merge {
            in_flight.insert(running.ticket_id);
        }
    }
    let latest_merge = store.latest_history_by_ticket(GateMode::Merge)?;

    let mut report = MergeReadyReport {
        snapshot: snapshot_path,
        dry_run: opts.dry_run,
        candidates: candidates.len(),
        queued: Vec::new(),
        skipped: Vec::new(),
    };

    for row in candidates {
        let ticket_id = row.ticket_id.trim().to_string();
        let skip = |reason: String| SkippedTicket {
            ticket_id: ticket_id.clone(),
            reason,
        };

        if in_flight.contains(&ticket_id) {
            report.skipped.push(skip("already queued/running".to_string()));
            continue;
        }
        if let Some(previous) = latest_merge.get(&ticket_id) {
            let status = previous.status;
            if status.is_passing() && !opts.requeue_passed {
                report
                    .skipped
                    .push(skip(format!("latest merge gate already {status}")));
                continue;
            }
            if matches!(status, JobStatus::Fail | JobStatus::Interrupted) && opts.skip_failed {
                report
                    .skipped
                    .push(skip(format!("latest merge gate is {status} and skip-failed is set")));
                continue;
            }
        }

        let job_id = if opts.dry_run {
            None
        } else {
            let receipt = driver.enqueue(EnqueueRequest {
                ticket_id: ticket_id.clone(),
                mode: GateMode::Merge,
                workdir: opts.workdir.clone(),
                branch: None,
                submitted_by: None,
                scoped_test: None,
            })?;
            Some(receipt.job_id)
        };
        tracing::info!(ticket = %ticket_id, dry_run = opts.dry_run, "merge gate queued");
        report.queued.push(QueuedTicket { ticket_id, job_id });

        if opts.max > 0 && report.queued.len() >= opts.max {
            break;
        }
    }

    Ok(report)
}
