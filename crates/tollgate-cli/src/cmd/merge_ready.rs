use crate::output::{print_json, print_table};
use clap::Args;
use std::path::{Path, PathBuf};
use tollgate_core::cancel::CancelToken;
use tollgate_core::config::GateConfig;
use tollgate_core::driver::QueueDriver;
use tollgate_core::merge_ready::{queue_merge_ready, MergeReadyOptions};
use tollgate_core::readiness::parse_date;

#[derive(Args)]
pub struct MergeReadyArgs {
    /// Snapshot date, YYYY-MM-DD (default: today, UTC)
    #[arg(long)]
    date: Option<String>,
    /// Read candidates from this snapshot instead of the dated one
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Use the existing dated snapshot without reconciling first
    #[arg(long)]
    skip_refresh: bool,
    /// Directory the MERGE jobs run in (default: project root)
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Enqueue at most N jobs (0 = no limit)
    #[arg(long, default_value_t = 0)]
    max: usize,
    /// Report what would be queued without enqueueing
    #[arg(long)]
    dry_run: bool,
    /// Queue tickets whose latest merge gate already passed
    #[arg(long)]
    requeue_passed: bool,
    /// Skip tickets whose latest merge gate failed or was interrupted
    #[arg(long)]
    skip_failed: bool,
}

pub fn run(root: &Path, args: MergeReadyArgs, json: bool) -> anyhow::Result<i32> {
    let date = match args.date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => chrono::Utc::now().date_naive(),
    };
    let opts = MergeReadyOptions {
        date,
        snapshot: args.snapshot,
        skip_refresh: args.skip_refresh,
        workdir: args.workdir.unwrap_or_else(|| root.to_path_buf()),
        max: args.max,
        dry_run: args.dry_run,
        requeue_passed: args.requeue_passed,
        skip_failed: args.skip_failed,
    };

    let driver = QueueDriver::new(root, GateConfig::load(root)?, CancelToken::never());
    let report = queue_merge_ready(root, &driver, &opts)?;

    if json {
        print_json(&report)?;
        return Ok(0);
    }

    let mut rows: Vec<Vec<String>> = report
        .queued
        .iter()
        .map(|q| {
            let action = if report.dry_run { "would queue" } else { "queued" };
            vec![
                q.ticket_id.clone(),
                action.to_string(),
                q.job_id.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    rows.extend(
        report
            .skipped
            .iter()
            .map(|s| vec![s.ticket_id.clone(), "skipped".to_string(), s.reason.clone()]),
    );
    if !rows.is_empty() {
        print_table(&["TICKET", "ACTION", "DETAIL"], rows);
        println!();
    }
    println!("{}", report.summary_line());
    Ok(0)
}
