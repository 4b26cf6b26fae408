//! Gate runner: executes one job's steps as external processes.
//!
//! Each step runs in its own process group so an interrupt reaches the
//! whole tree the build tool spawns. Interruption arrives through a
//! [`CancelToken`] awaited next to the child; it is the only suspension point.

use crate::baseline;
use crate::cancel::CancelToken;
use crate::config::GateConfig;
use crate::error::{Result, TollgateError};
use crate::io::{atomic_write, ensure_dir};
use crate::job::{
    display_command, parse_scoped_test, step_run_id, Job, Step, StepArtifacts,
    INTERRUPTED_EXIT_CODE,
};
use crate::paths;
use crate::types::{GateMode, JobStatus, StepStatus};
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

// ---------------------------------------------------------------------------
// Step plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: &'static str,
    pub args: Vec<String>,
}

/// Ordered steps for a job. TICKET jobs swap the full test run for the
/// job's scoped test command.
pub fn plan_steps(job: &Job, config: &GateConfig) -> Result<Vec<PlannedStep>> {
    let test = match job.mode {
        GateMode::Ticket => {
            let raw = if job.scoped_test_command.trim().is_empty() {
                config.default_scoped_test.as_str()
            } else {
                job.scoped_test_command.as_str()
            };
            PlannedStep {
                name: "scoped_test",
                args: parse_scoped_test(raw, &config.scoped_test_wrappers)?,
            }
        }
        GateMode::Merge => PlannedStep {
            name: "test",
            args: config.test_args.clone(),
        },
    };
    Ok(vec![
        PlannedStep {
            name: "check",
            args: config.check_args.clone(),
        },
        test,
        PlannedStep {
            name: "fmt",
            args: config.fmt_args.clone(),
        },
    ])
}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

// ---------------------------------------------------------------------------
// GateRunner
// ---------------------------------------------------------------------------

pub struct GateRunner {
    root: PathBuf,
    config: GateConfig,
    cancel: CancelToken,
}

impl GateRunner {
    pub fn new(root: &Path, config: GateConfig, cancel: CancelToken) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            cancel,
        }
    }

    /// Run every step of `job` and return it in a terminal state. Failures
    /// inside the runner itself become a FAIL outcome with `error` set.
    pub async fn run_job(&self, mut job: Job) -> Job {
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.steps.clear();
        job.error = None;
        job.history_file = Some(paths::history_dir(&self.root).join(format!("{}.json", job.job_id)));

        tracing::info!(job_id = %job.job_id, ticket = %job.ticket_id, mode = %job.mode, "job started");
        match self.execute(&mut job).await {
            Ok(status) => job.finish(status),
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "job aborted by runner error");
                job.error = Some(e.to_string());
                job.finish(JobStatus::Fail);
            }
        }
        tracing::info!(job_id = %job.job_id, status = %job.status, "job finished");
        job
    }

    async fn execute(&self, job: &mut Job) -> Result<JobStatus> {
        let plan = plan_steps(job, &self.config)?;
        let mut waived = false;

        for planned in &plan {
            let mut step = self.run_step(job, planned).await?;

            if step.status == StepStatus::Interrupted {
                job.steps.push(step);
                return Ok(JobStatus::Interrupted);
            }
            if job.mode == GateMode::Merge && planned.name == "test" && step.exit_code != 0 {
                waived |= self.apply_waiver(&mut step);
            }

            let passed = step.passed();
            job.steps.push(step);
            if !passed {
                return Ok(JobStatus::Fail);
            }
        }

        Ok(if waived {
            JobStatus::WaivedBaseline
        } else {
            JobStatus::Pass
        })
    }

    async fn run_step(&self, job: &Job, planned: &PlannedStep) -> Result<Step> {
        let run_id = step_run_id(&job.job_id, planned.name);
        let log_file = paths::step_log_path(&self.root, &run_id);
        let meta_file = paths::step_meta_path(&self.root, &run_id);
        ensure_dir(&paths::gates_dir(&self.root))?;

        let log = OpenOptions::new().create(true).append(true).open(&log_file)?;
        let log_err = log.try_clone()?;
        let command = display_command(&self.config.program, &planned.args);
        let started_at = Utc::now();

        let mut child = Command::new(&self.config.program)
            .args(&planned.args)
            .current_dir(&job.workdir)
            .env("GATE_RUN_ID", &run_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TollgateError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;
        tracing::info!(job_id = %job.job_id, step = planned.name, run_id = %run_id, "step started");

        let outcome = tokio::select! {
            status = child.wait() => Ok(status?),
            signal = self.cancel.cancelled() => Err(signal),
        };
        let (exit_code, signal) = match outcome {
            Ok(status) => (exit_code_of(status), None),
            Err(signal) => {
                tracing::warn!(job_id = %job.job_id, step = planned.name, signal, "interrupting step");
                terminate(&mut child, self.config.grace_period()).await;
                (INTERRUPTED_EXIT_CODE, Some(signal))
            }
        };
        let finished_at = Utc::now();
        let interrupted = signal.is_some();

        let mut meta = BTreeMap::new();
        meta.insert("run_id".to_string(), run_id.clone());
        meta.insert("job_id".to_string(), job.job_id.clone());
        meta.insert("step".to_string(), planned.name.to_string());
        meta.insert("command".to_string(), command.clone());
        meta.insert("workdir".to_string(), job.workdir.display().to_string());
        meta.insert("started_at".to_string(), started_at.to_rfc3339());
        meta.insert("finished_at".to_string(), finished_at.to_rfc3339());
        meta.insert("exit_code".to_string(), exit_code.to_string());
        meta.insert("interrupted".to_string(), interrupted.to_string());
        write_meta(&meta_file, &meta)?;

        let status = if interrupted {
            StepStatus::Interrupted
        } else if exit_code == 0 {
            StepStatus::Pass
        } else {
            StepStatus::Fail
        };
        tracing::info!(job_id = %job.job_id, step = planned.name, exit_code, %status, "step finished");

        Ok(Step {
            name: planned.name.to_string(),
            command,
            started_at,
            finished_at,
            status,
            interrupted,
            signal,
            exit_code,
            effective_exit_code: exit_code,
            artifacts: StepArtifacts {
                run_id,
                log_file,
                meta_file,
                meta,
            },
            baseline_waiver: None,
        })
    }

    /// Compare a failed full test run against the allowlist. Returns true
    /// when the step was waived.
    fn apply_waiver(&self, step: &mut Step) -> bool {
        let out = paths::step_baseline_eval_path(&self.root, &step.artifacts.run_id);
        let baseline_file = paths::baseline_path(&self.root);
        let evaluation = match baseline::evaluate(&step.artifacts.log_file, &baseline_file, Some(&out)) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::warn!(run_id = %step.artifacts.run_id, error = %e, "baseline evaluation failed; not waiving");
                return false;
            }
        };
        let waive = evaluation.only_known_failures;
        if waive {
            step.status = StepStatus::WaivedBaseline;
            step.effective_exit_code = 0;
        }
        step.baseline_waiver = Some(evaluation);
        waive
    }
}

fn write_meta(path: &Path, meta: &BTreeMap<String, String>) -> Result<()> {
    let mut text = String::new();
    for (key, value) in meta {
        text.push_str(&format!("{key}={}\n", value.replace('\n', " ")));
    }
    atomic_write(path, text.as_bytes())
}

/// SIGTERM the step's process group, then SIGKILL it if the leader has not
/// exited within `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM to step process group failed");
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    tracing::warn!(pid, grace_secs = grace.as_secs(), "step ignored SIGTERM; killing process group");
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "SIGKILL to step process group failed");
    }
    let _ = child.wait().await;
}
