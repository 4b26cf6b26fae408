use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::{Subcommand, ValueEnum};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tollgate_core::cancel::{CancelHandle, CancelToken};
use tollgate_core::config::GateConfig;
use tollgate_core::driver::{EnqueueRequest, LoopOptions, QueueDriver, RunNextOutcome};
use tollgate_core::job::Job;
use tollgate_core::types::GateMode;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Add a gate job to the pending queue
    Enqueue {
        /// Ticket id the job verifies
        #[arg(long)]
        ticket: String,
        /// TICKET (check, scoped test, fmt) or MERGE (check, full test, fmt)
        #[arg(long, value_enum, ignore_case = true)]
        mode: ModeArg,
        /// Directory the steps run in (default: project root)
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Branch recorded on the job (default: current git branch)
        #[arg(long)]
        branch: Option<String>,
        /// Scoped test command for TICKET mode, e.g. "cargo-safe test --lib"
        #[arg(long)]
        scoped_test: Option<String>,
        /// Submitter recorded on the job (default: $USER)
        #[arg(long)]
        submitted_by: Option<String>,
    },

    /// Run the next pending job, if any
    RunNext {
        /// Wait for the runner lock instead of exiting with 75
        #[arg(long)]
        wait_lock: bool,
    },

    /// Run jobs until the queue is idle (or a given job finishes)
    RunLoop {
        /// Wait for the runner lock instead of sleeping between attempts
        #[arg(long)]
        wait_lock: bool,
        /// Seconds to sleep between passes (default: loop_sleep_secs from config)
        #[arg(long)]
        sleep: Option<f64>,
        /// Keep running until this job's history is terminal
        #[arg(long)]
        until_job: Option<String>,
    },

    /// Show pending count, running job, and recent history
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    #[value(name = "TICKET")]
    Ticket,
    #[value(name = "MERGE")]
    Merge,
}

impl From<ModeArg> for GateMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Ticket => GateMode::Ticket,
            ModeArg::Merge => GateMode::Merge,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<i32> {
    match subcmd {
        QueueSubcommand::Enqueue {
            ticket,
            mode,
            workdir,
            branch,
            scoped_test,
            submitted_by,
        } => {
            let req = EnqueueRequest {
                ticket_id: ticket,
                mode: mode.into(),
                workdir: workdir.unwrap_or_else(|| root.to_path_buf()),
                branch,
                submitted_by,
                scoped_test,
            };
            enqueue(root, req, json)
        }
        QueueSubcommand::RunNext { wait_lock } => run_next(root, wait_lock, json),
        QueueSubcommand::RunLoop {
            wait_lock,
            sleep,
            until_job,
        } => run_loop(root, wait_lock, sleep, until_job, json),
        QueueSubcommand::Status => status(root, json),
    }
}

fn load_config(root: &Path) -> anyhow::Result<GateConfig> {
    GateConfig::load(root).context("failed to load gate config")
}

// ---------------------------------------------------------------------------
// enqueue
// ---------------------------------------------------------------------------

fn enqueue(root: &Path, req: EnqueueRequest, json: bool) -> anyhow::Result<i32> {
    let driver = QueueDriver::new(root, load_config(root)?, CancelToken::never());
    let receipt = driver.enqueue(req)?;

    if json {
        print_json(&receipt)?;
    } else {
        println!(
            "ENQUEUED job_id={} ticket={} mode={}",
            receipt.job_id, receipt.ticket_id, receipt.mode
        );
        println!("HISTORY {}", receipt.history_file.display());
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// run-next / run-loop
// ---------------------------------------------------------------------------

/// Run `body` on a fresh runtime with SIGINT, SIGTERM and SIGHUP wired to
/// the driver's cancel token.
fn with_driver<F, Fut>(root: &Path, body: F) -> anyhow::Result<i32>
where
    F: FnOnce(QueueDriver) -> Fut,
    Fut: Future<Output = anyhow::Result<i32>>,
{
    let config = load_config(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (handle, token) = CancelHandle::new();
        listen_for_signals(handle).context("failed to install signal handlers")?;
        body(QueueDriver::new(root, config, token)).await
    })
}

fn listen_for_signals(handle: CancelHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    const SIGHUP: i32 = 1;
    const SIGINT: i32 = 2;
    const SIGTERM: i32 = 15;

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let signo = tokio::select! {
                _ = hangup.recv() => SIGHUP,
                _ = interrupt.recv() => SIGINT,
                _ = terminate.recv() => SIGTERM,
            };
            tracing::warn!(signal = signo, "cancel requested");
            handle.cancel(signo);
        }
    });
    Ok(())
}

fn run_next(root: &Path, wait_lock: bool, json: bool) -> anyhow::Result<i32> {
    with_driver(root, |driver| async move {
        let outcome = driver.run_next(wait_lock).await?;
        report_outcome(&outcome, json, true);
        Ok(outcome.exit_code())
    })
}

fn run_loop(
    root: &Path,
    wait_lock: bool,
    sleep: Option<f64>,
    until_job: Option<String>,
    json: bool,
) -> anyhow::Result<i32> {
    let sleep = match sleep {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid --sleep value: {secs}"))?,
        None => load_config(root)?.loop_sleep(),
    };
    let opts = LoopOptions {
        wait_lock,
        sleep,
        until_job,
    };
    with_driver(root, |driver| async move {
        let code = driver
            .run_loop(&opts, |outcome| report_outcome(outcome, json, false))
            .await?;
        Ok(code)
    })
}

fn outcome_json(outcome: &RunNextOutcome) -> serde_json::Value {
    let (name, job) = match outcome {
        RunNextOutcome::Idle => ("idle", None),
        RunNextOutcome::Busy => ("busy", None),
        RunNextOutcome::Cancelled => ("cancelled", None),
        RunNextOutcome::Completed(job) => ("completed", Some(job)),
    };
    serde_json::json!({
        "outcome": name,
        "exit_code": outcome.exit_code(),
        "job": job,
    })
}

/// Print one outcome. In a loop, JSON outcomes are emitted one per line and
/// idle/busy passes are not printed in human mode.
fn report_outcome(outcome: &RunNextOutcome, json: bool, single: bool) {
    if json {
        let value = outcome_json(outcome);
        if single {
            if let Ok(text) = serde_json::to_string_pretty(&value) {
                println!("{text}");
            }
        } else {
            println!("{value}");
        }
        return;
    }

    match outcome {
        RunNextOutcome::Idle if single => println!("IDLE: no pending gate jobs"),
        RunNextOutcome::Busy if single => {
            eprintln!("BUSY: gate runner lock held by another process")
        }
        RunNextOutcome::Idle | RunNextOutcome::Busy => {}
        RunNextOutcome::Cancelled => eprintln!("CANCELLED: stopped before starting a job"),
        RunNextOutcome::Completed(job) => print_job(job),
    }
}

fn print_job(job: &Job) {
    println!(
        "COMPLETED job_id={} ticket={} mode={} status={}",
        job.job_id, job.ticket_id, job.mode, job.status
    );
    if !job.steps.is_empty() {
        let rows = job
            .steps
            .iter()
            .map(|step| {
                vec![
                    step.name.clone(),
                    step.status.to_string(),
                    step.exit_code.to_string(),
                    step.effective_exit_code.to_string(),
                    step.artifacts.log_file.display().to_string(),
                ]
            })
            .collect();
        print_table(&["STEP", "STATUS", "EXIT", "EFFECTIVE", "LOG"], rows);
    }
    if let Some(error) = &job.error {
        println!("error: {error}");
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

fn status(root: &Path, json: bool) -> anyhow::Result<i32> {
    let driver = QueueDriver::new(root, load_config(root)?, CancelToken::never());
    let status = driver.status()?;

    if json {
        print_json(&status)?;
        return Ok(0);
    }

    println!("pending={}", status.pending_count);
    match &status.running {
        Some(job) => println!(
            "running job_id={} ticket={} mode={}",
            job.job_id, job.ticket_id, job.mode
        ),
        None => println!("running=none"),
    }
    println!("latest history:");
    for path in &status.latest_history {
        println!("- {}", path.display());
    }
    Ok(0)
}
