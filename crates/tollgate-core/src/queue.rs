//! Durable gate queue: FIFO pending file, single running slot, per-job history.
//!
//! Two advisory file locks guard it. The data lock is held only while queue
//! metadata is read or rewritten. The runner lock is held for the whole
//! execution of a job and serializes runners. The data lock is never held
//! while waiting for the runner lock.

use crate::baseline::ensure_baseline;
use crate::error::{Result, TollgateError};
use crate::io::{atomic_write, ensure_dir, write_if_missing, write_json_pretty};
use crate::job::Job;
use crate::paths;
use crate::types::{GateMode, JobStatus};
use chrono::{DateTime, Utc};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

fn open_lock_file(path: &Path) -> Result<RwLock<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    Ok(RwLock::new(file))
}

/// Exclusive right to execute jobs. Dropping the guard releases it.
pub struct RunnerLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl RunnerLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without blocking. A held lock yields
    /// [`TollgateError::LockBusy`].
    pub fn acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        match self.lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(TollgateError::LockBusy(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueStore {
    pending_file: PathBuf,
    running_file: PathBuf,
    history_dir: PathBuf,
    baseline_file: PathBuf,
    data_lock: PathBuf,
    runner_lock: PathBuf,
}

impl QueueStore {
    pub fn new(root: &Path) -> Self {
        let queue_dir = paths::queue_dir(root);
        Self {
            pending_file: queue_dir.join(paths::PENDING_FILE),
            running_file: queue_dir.join(paths::RUNNING_FILE),
            history_dir: paths::history_dir(root),
            baseline_file: paths::baseline_path(root),
            data_lock: paths::data_lock_path(root),
            runner_lock: paths::runner_lock_path(root),
        }
    }

    pub fn pending_file(&self) -> &Path {
        &self.pending_file
    }

    pub fn running_file(&self) -> &Path {
        &self.running_file
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn baseline_file(&self) -> &Path {
        &self.baseline_file
    }

    pub fn history_path(&self, job_id: &str) -> PathBuf {
        self.history_dir.join(format!("{job_id}.json"))
    }

    /// Create the queue layout: directories, an empty pending file, an idle
    /// running slot, and an empty baseline allowlist.
    pub fn ensure(&self) -> Result<()> {
        ensure_dir(&self.history_dir)?;
        write_if_missing(&self.pending_file, b"")?;
        write_if_missing(&self.running_file, b"{}\n")?;
        ensure_baseline(&self.baseline_file)?;
        Ok(())
    }

    /// Run `f` while holding the data lock, waiting for it if necessary.
    pub fn with_data_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut lock = open_lock_file(&self.data_lock)?;
        let _guard = lock.write()?;
        f()
    }

    pub fn runner_lock(&self) -> Result<RunnerLock> {
        Ok(RunnerLock {
            path: self.runner_lock.clone(),
            lock: open_lock_file(&self.runner_lock)?,
        })
    }

    // -----------------------------------------------------------------------
    // Pending
    // -----------------------------------------------------------------------

    fn load_pending(&self) -> Result<Vec<Job>> {
        if !self.pending_file.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.pending_file)?;
        data.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| TollgateError::CorruptQueue {
                    path: self.pending_file.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn save_pending(&self, jobs: &[Job]) -> Result<()> {
        let mut data = String::new();
        for job in jobs {
            data.push_str(&serde_json::to_string(job)?);
            data.push('\n');
        }
        atomic_write(&self.pending_file, data.as_bytes())
    }

    /// Append `job` to the tail of the queue.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        self.with_data_lock(|| {
            let mut pending = self.load_pending()?;
            pending.push(job.clone());
            self.save_pending(&pending)
        })?;
        tracing::info!(job_id = %job.job_id, ticket = %job.ticket_id, mode = %job.mode, "job enqueued");
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<Job>> {
        self.with_data_lock(|| self.load_pending())
    }

    /// Move the head of the queue into the running slot, marked RUNNING.
    /// The slot is written before the pending file is rewritten, so a
    /// failure in between leaves the job visible in at least one of them.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        self.with_data_lock(|| {
            let mut pending = self.load_pending()?;
            if pending.is_empty() {
                return Ok(None);
            }
            let mut job = pending.remove(0);
            job.status = JobStatus::Running;
            write_json_pretty(&self.running_file, &job)?;
            self.save_pending(&pending)?;
            Ok(Some(job))
        })
    }

    // -----------------------------------------------------------------------
    // Running slot
    // -----------------------------------------------------------------------

    fn load_running(&self) -> Result<Option<Job>> {
        if !self.running_file.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.running_file)?;
        let value: serde_json::Value = if data.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&data)?
        };
        let idle = match &value {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if idle {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| TollgateError::CorruptQueue {
                path: self.running_file.clone(),
                reason: e.to_string(),
            })
    }

    pub fn running(&self) -> Result<Option<Job>> {
        self.with_data_lock(|| self.load_running())
    }

    #[cfg(test)]
    pub fn set_running(&self, job: &Job) -> Result<()> {
        self.with_data_lock(|| write_json_pretty(&self.running_file, job))
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Record `job` in history, then empty the running slot, in one critical
    /// section. If the history write fails the slot still holds the job for
    /// the next runner to recover.
    pub fn finish(&self, job: &Job) -> Result<PathBuf> {
        let path = self.history_path(&job.job_id);
        self.with_data_lock(|| {
            write_json_pretty(&path, job)?;
            atomic_write(&self.running_file, b"{}\n")
        })?;
        tracing::info!(job_id = %job.job_id, status = %job.status, "job recorded in history");
        Ok(path)
    }

    pub fn read_history(&self, job_id: &str) -> Result<Option<Job>> {
        let path = self.history_path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn history_files(&self) -> Result<Vec<PathBuf>> {
        if !self.history_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.history_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Every readable history record, in file-name order.
    pub fn history_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for path in self.history_files()? {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<Job>(&s).map_err(|e| e.to_string()));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable history record");
                }
            }
        }
        Ok(jobs)
    }

    /// Most recent history record per ticket for `mode`, by finish time
    /// (submission time for records that never finished).
    pub fn latest_history_by_ticket(&self, mode: GateMode) -> Result<BTreeMap<String, Job>> {
        let mut latest: BTreeMap<String, Job> = BTreeMap::new();
        for job in self.history_jobs()? {
            if job.mode != mode || job.ticket_id.trim().is_empty() {
                continue;
            }
            let newer = match latest.get(&job.ticket_id) {
                Some(current) => history_time(&job) >= history_time(current),
                None => true,
            };
            if newer {
                latest.insert(job.ticket_id.clone(), job);
            }
        }
        Ok(latest)
    }

    pub fn latest_history(&self, ticket_id: &str, mode: GateMode) -> Result<Option<Job>> {
        Ok(self.latest_history_by_ticket(mode)?.remove(ticket_id))
    }

    /// History files by modification time, newest first.
    pub fn recent_history_files(&self, limit: usize) -> Result<Vec<PathBuf>> {
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = self
            .history_files()?
            .into_iter()
            .map(|p| {
                let mtime = std::fs::metadata(&p)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                (mtime, p)
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(files.into_iter().take(limit).map(|(_, p)| p).collect())
    }

    /// Close out a job left in the running slot by a runner that died.
    /// Call only while holding the runner lock.
    pub fn recover_stale_running(&self) -> Result<Option<Job>> {
        let Some(mut job) = self.running()? else {
            return Ok(None);
        };
        tracing::warn!(job_id = %job.job_id, "recovering job orphaned in running slot");
        job.finish(JobStatus::Interrupted);
        job.error = Some("runner exited before the job finished; recovered as interrupted".to_string());
        job.history_file = Some(self.history_path(&job.job_id));
        self.finish(&job)?;
        Ok(Some(job))
    }
}

fn history_time(job: &Job) -> DateTime<Utc> {
    job.finished_at.unwrap_or(job.submitted_at)
}
