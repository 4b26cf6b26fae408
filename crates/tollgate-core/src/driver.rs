//! Operational surface over the queue store and gate runner:
//! enqueue, run-next, run-loop, and status.

use crate::artifact::parse_metadata;
use crate::cancel::CancelToken;
use crate::config::GateConfig;
use crate::error::{Result, TollgateError};
use crate::job::{parse_scoped_test, Job};
use crate::paths;
use crate::queue::QueueStore;
use crate::runner::GateRunner;
use crate::types::GateMode;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often a `--wait-lock` runner re-checks a held runner lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Exit code when a cancel arrives outside any job. Same as a failed job:
/// no gate passed.
pub const CANCELLED_EXIT_CODE: i32 = 1;

/// Exit code for "runner lock busy, retry later".
pub const BUSY_EXIT_CODE: i32 = 75;

pub const STATUS_HISTORY_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub ticket_id: String,
    pub mode: GateMode,
    pub workdir: PathBuf,
    pub branch: Option<String>,
    pub submitted_by: Option<String>,
    pub scoped_test: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: String,
    pub ticket_id: String,
    pub mode: GateMode,
    pub pending_file: PathBuf,
    pub history_file: PathBuf,
}

/// Current branch of the git checkout at `workdir`, or `unknown`.
pub fn current_branch(workdir: &Path) -> String {
    std::process::Command::new("git")
        .arg("-C")
        .arg(workdir)
        .args(["branch", "--show-current"])
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|branch| !branch.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `scoped_test_command` declared in the ticket's backlog file, if any.
/// Inline-code backticks around the command are dropped.
pub fn scoped_test_from_ticket(root: &Path, ticket_id: &str) -> Option<String> {
    let text = std::fs::read_to_string(paths::backlog_ticket(root, ticket_id)).ok()?;
    parse_metadata(&text)
        .remove("scoped_test_command")
        .map(|cmd| cmd.trim().trim_matches('`').trim().to_string())
        .filter(|cmd| !cmd.is_empty())
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RunNextOutcome {
    /// Nothing pending.
    Idle,
    /// Another runner holds the runner lock.
    Busy,
    /// Cancelled before a job was started.
    Cancelled,
    Completed(Job),
}

impl RunNextOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunNextOutcome::Idle => 0,
            RunNextOutcome::Busy => BUSY_EXIT_CODE,
            RunNextOutcome::Cancelled => CANCELLED_EXIT_CODE,
            RunNextOutcome::Completed(job) => job.exit_code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub wait_lock: bool,
    pub sleep: Duration,
    pub until_job: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub running: Option<Job>,
    pub latest_history: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// QueueDriver
// ---------------------------------------------------------------------------

pub struct QueueDriver {
    root: PathBuf,
    store: QueueStore,
    config: GateConfig,
    cancel: CancelToken,
}

impl QueueDriver {
    pub fn new(root: &Path, config: GateConfig, cancel: CancelToken) -> Self {
        Self {
            root: root.to_path_buf(),
            store: QueueStore::new(root),
            config,
            cancel,
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Validate `req`, build the job, and append it to the queue. Configuration
    /// problems are reported before anything is written.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueReceipt> {
        let workdir = req
            .workdir
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| TollgateError::WorkdirMissing(req.workdir.clone()))?;

        let explicit = req.scoped_test.filter(|cmd| !cmd.trim().is_empty());
        let scoped = match req.mode {
            GateMode::Ticket => {
                let cmd = explicit
                    .or_else(|| scoped_test_from_ticket(&self.root, &req.ticket_id))
                    .unwrap_or_else(|| self.config.default_scoped_test.clone());
                parse_scoped_test(&cmd, &self.config.scoped_test_wrappers)?;
                cmd
            }
            GateMode::Merge => explicit.unwrap_or_default(),
        };

        let branch = req.branch.unwrap_or_else(|| current_branch(&workdir));
        let submitted_by = req
            .submitted_by
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string());

        let job = Job::new(req.ticket_id, req.mode, workdir, branch, submitted_by, scoped);
        self.store.ensure()?;
        self.store.enqueue(&job)?;

        Ok(EnqueueReceipt {
            history_file: self.store.history_path(&job.job_id),
            pending_file: self.store.pending_file().to_path_buf(),
            job_id: job.job_id,
            ticket_id: job.ticket_id,
            mode: job.mode,
        })
    }

    /// Take the runner lock, pop one job, run it, and record it in history.
    pub async fn run_next(&self, wait_lock: bool) -> Result<RunNextOutcome> {
        self.store.ensure()?;
        let mut runner_lock = self.store.runner_lock()?;
        let _guard = loop {
            match runner_lock.acquire() {
                Ok(guard) => break guard,
                Err(TollgateError::LockBusy(_)) if wait_lock => {}
                Err(TollgateError::LockBusy(path)) => {
                    tracing::debug!(lock = %path.display(), "runner lock busy");
                    return Ok(RunNextOutcome::Busy);
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
                _ = self.cancel.cancelled() => return Ok(RunNextOutcome::Cancelled),
            }
        };

        if let Some(recovered) = self.store.recover_stale_running()? {
            tracing::warn!(job_id = %recovered.job_id, "previous runner left a job behind");
        }
        if self.cancel.is_cancelled() {
            return Ok(RunNextOutcome::Cancelled);
        }
        let Some(job) = self.store.claim_next()? else {
            return Ok(RunNextOutcome::Idle);
        };

        let runner = GateRunner::new(&self.root, self.config.clone(), self.cancel.clone());
        let done = runner.run_job(job).await;
        self.store.finish(&done)?;
        Ok(RunNextOutcome::Completed(done))
    }

    /// Drain the queue. `report` sees every run-next outcome as it happens.
    pub async fn run_loop(
        &self,
        opts: &LoopOptions,
        mut report: impl FnMut(&RunNextOutcome),
    ) -> Result<i32> {
        let mut exit_code = 0;
        loop {
            let outcome = self.run_next(opts.wait_lock).await?;
            report(&outcome);

            match &outcome {
                RunNextOutcome::Cancelled => return Ok(outcome.exit_code()),
                RunNextOutcome::Busy => {
                    if self.pause(opts.sleep).await {
                        return Ok(CANCELLED_EXIT_CODE);
                    }
                    continue;
                }
                RunNextOutcome::Idle | RunNextOutcome::Completed(_) => {}
            }

            if let Some(target) = &opts.until_job {
                if let Some(job) = self.store.read_history(target)? {
                    if job.status.is_terminal() {
                        return Ok(job.exit_code());
                    }
                } else if matches!(outcome, RunNextOutcome::Idle) && !self.is_queued(target)? {
                    return Err(TollgateError::JobNotFound(target.clone()));
                }
            } else {
                match &outcome {
                    RunNextOutcome::Idle => return Ok(exit_code),
                    RunNextOutcome::Completed(job) => {
                        if job.exit_code() != 0 {
                            exit_code = job.exit_code();
                        }
                        if self.store.pending()?.is_empty() {
                            return Ok(exit_code);
                        }
                    }
                    RunNextOutcome::Busy | RunNextOutcome::Cancelled => {}
                }
            }

            if self.cancel.is_cancelled() || self.pause(opts.sleep).await {
                return Ok(exit_code.max(1));
            }
        }
    }

    fn is_queued(&self, job_id: &str) -> Result<bool> {
        let running = self.store.running()?;
        Ok(running.is_some_and(|job| job.job_id == job_id)
            || self.store.pending()?.iter().any(|job| job.job_id == job_id))
    }

    /// Sleep unless cancelled first. Returns true on cancel.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    pub fn status(&self) -> Result<QueueStatus> {
        self.store.ensure()?;
        Ok(QueueStatus {
            pending_count: self.store.pending()?.len(),
            running: self.store.running()?,
            latest_history: self.store.recent_history_files(STATUS_HISTORY_LIMIT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::testutil::{fake_tool, write};
    use crate::types::JobStatus;
    use tempfile::TempDir;

    fn driver(root: &Path, test_body: &str) -> QueueDriver {
        let tool = fake_tool(root, test_body);
        let config = GateConfig {
            program: tool.display().to_string(),
            grace_period_secs: 1,
            ..GateConfig::default()
        };
        QueueDriver::new(root, config, CancelToken::never())
    }

    fn request(root: &Path, ticket: &str, mode: GateMode) -> EnqueueRequest {
        EnqueueRequest {
            ticket_id: ticket.to_string(),
            mode,
            workdir: root.to_path_buf(),
            branch: Some("main".to_string()),
            submitted_by: Some("tester".to_string()),
            scoped_test: None,
        }
    }

    fn fast_loop() -> LoopOptions {
        LoopOptions {
            wait_lock: false,
            sleep: Duration::from_millis(10),
            until_job: None,
        }
    }

    #[test]
    fn enqueue_rejects_missing_workdir() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        let mut req = request(dir.path(), "A", GateMode::Ticket);
        req.workdir = dir.path().join("nope");
        assert!(matches!(d.enqueue(req), Err(TollgateError::WorkdirMissing(_))));
        assert!(!d.store().pending_file().exists());
    }

    #[test]
    fn enqueue_rejects_bad_scoped_command() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        let mut req = request(dir.path(), "A", GateMode::Ticket);
        req.scoped_test = Some("cargo build".to_string());
        let err = d.enqueue(req).unwrap_err();
        assert!(err.is_configuration());
        assert!(d.status().unwrap().pending_count == 0);
    }

    #[test]
    fn enqueue_prefers_ticket_metadata_then_default() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "agents/backlog/NB-T7.md",
            "## Metadata\n- Ticket ID: NB-T7\n- Scoped Test Command: `cargo test -p core`\n",
        );
        let d = driver(dir.path(), "exit 0");
        d.enqueue(request(dir.path(), "NB-T7", GateMode::Ticket)).unwrap();
        d.enqueue(request(dir.path(), "NB-T8", GateMode::Ticket)).unwrap();
        d.enqueue(request(dir.path(), "NB-T9", GateMode::Merge)).unwrap();

        let pending = d.store().pending().unwrap();
        assert_eq!(pending[0].scoped_test_command, "cargo test -p core");
        assert_eq!(pending[1].scoped_test_command, "cargo-safe test --lib");
        assert_eq!(pending[2].scoped_test_command, "");
        assert_eq!(pending[0].branch, "main");
        assert_eq!(pending[0].workdir, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn idle_queue_reports_idle() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        let outcome = d.run_next(false).await.unwrap();
        assert!(matches!(outcome, RunNextOutcome::Idle));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn jobs_complete_in_enqueue_order() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        for ticket in ["A", "B", "C"] {
            d.enqueue(request(dir.path(), ticket, GateMode::Merge)).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            match d.run_next(false).await.unwrap() {
                RunNextOutcome::Completed(job) => {
                    assert_eq!(job.status, JobStatus::Pass);
                    order.push(job.ticket_id);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(d.status().unwrap().running.is_none());
        assert_eq!(d.status().unwrap().latest_history.len(), 3);
    }

    #[tokio::test]
    async fn held_runner_lock_means_busy() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        d.enqueue(request(dir.path(), "A", GateMode::Merge)).unwrap();

        let mut other = d.store().runner_lock().unwrap();
        let guard = other.acquire().unwrap();
        let outcome = d.run_next(false).await.unwrap();
        assert_eq!(outcome.exit_code(), BUSY_EXIT_CODE);
        assert_eq!(d.status().unwrap().pending_count, 1);
        drop(guard);

        assert!(matches!(
            d.run_next(false).await.unwrap(),
            RunNextOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn orphaned_running_job_is_recovered_first() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        let mut orphan = Job::new("Z", GateMode::Merge, dir.path().into(), "m", "u", "");
        orphan.status = JobStatus::Running;
        d.store().set_running(&orphan).unwrap();

        let outcome = d.run_next(false).await.unwrap();
        assert!(matches!(outcome, RunNextOutcome::Idle));
        let hist = d.store().read_history(&orphan.job_id).unwrap().unwrap();
        assert_eq!(hist.status, JobStatus::Interrupted);
    }

    #[tokio::test]
    async fn loop_drains_and_returns_last_failure() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 1");
        d.enqueue(request(dir.path(), "A", GateMode::Merge)).unwrap();
        d.enqueue(request(dir.path(), "B", GateMode::Merge)).unwrap();

        let mut seen = 0;
        let code = d.run_loop(&fast_loop(), |_| seen += 1).await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(seen, 2);
        assert_eq!(d.status().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn loop_on_idle_queue_exits_zero() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        assert_eq!(d.run_loop(&fast_loop(), |_| {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_until_job_returns_that_jobs_code() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        d.enqueue(request(dir.path(), "A", GateMode::Merge)).unwrap();
        let target = d.enqueue(request(dir.path(), "B", GateMode::Merge)).unwrap();

        let opts = LoopOptions {
            until_job: Some(target.job_id.clone()),
            ..fast_loop()
        };
        assert_eq!(d.run_loop(&opts, |_| {}).await.unwrap(), 0);
        assert!(d.store().read_history(&target.job_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn loop_until_unknown_job_errors_when_idle() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), "exit 0");
        let opts = LoopOptions {
            until_job: Some("no-such-job".to_string()),
            ..fast_loop()
        };
        assert!(matches!(
            d.run_loop(&opts, |_| {}).await,
            Err(TollgateError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_job_is_recorded_not_left_running() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(dir.path(), "sleep 30");
        let config = GateConfig {
            program: tool.display().to_string(),
            grace_period_secs: 1,
            ..GateConfig::default()
        };
        let (handle, token) = CancelHandle::new();
        let d = QueueDriver::new(dir.path(), config, token);
        let receipt = d.enqueue(request(dir.path(), "A", GateMode::Merge)).unwrap();
        d.enqueue(request(dir.path(), "B", GateMode::Merge)).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.cancel(2);
        });
        let code = d.run_loop(&fast_loop(), |_| {}).await.unwrap();
        assert_eq!(code, 1);

        let hist = d.store().read_history(&receipt.job_id).unwrap().unwrap();
        assert_eq!(hist.status, JobStatus::Interrupted);
        assert_eq!(hist.interrupted_steps(), 1);
        assert!(d.store().running().unwrap().is_none());
        assert_eq!(d.status().unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn cancel_before_start_leaves_job_pending_and_exits_one() {
        let dir = TempDir::new().unwrap();
        let (handle, token) = CancelHandle::new();
        let d = QueueDriver::new(dir.path(), GateConfig::default(), token);
        d.enqueue(request(dir.path(), "A", GateMode::Merge)).unwrap();

        handle.cancel(15);
        let outcome = d.run_next(false).await.unwrap();
        assert!(matches!(outcome, RunNextOutcome::Cancelled));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(d.status().unwrap().pending_count, 1);
        assert!(d.store().running().unwrap().is_none());
    }
}
