use chrono::NaiveDate;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const AGENTS_DIR: &str = "agents";
pub const BACKLOG_DIR: &str = "agents/backlog";
pub const REPORTS_DIR: &str = "agents/reports";
pub const QA_DIR: &str = "agents/qa";
pub const MERGE_DIR: &str = "agents/merge";
pub const GATES_DIR: &str = "agents/status/gates";
pub const QUEUE_DIR: &str = "agents/status/gates/queue";
pub const HISTORY_DIR: &str = "agents/status/gates/queue/history";
pub const RELEASE_DIR: &str = "agents/status/release";

pub const PENDING_FILE: &str = "pending.jsonl";
pub const RUNNING_FILE: &str = "running.json";
pub const BASELINE_FILE: &str = "baseline_failures.json";
pub const GATE_CONFIG_FILE: &str = "gate_config.yaml";

pub const RUNNER_LOCK_FILE: &str = ".agent_gate_queue.lock";
pub const DATA_LOCK_FILE: &str = ".agent_gate_queue_data.lock";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn backlog_dir(root: &Path) -> PathBuf {
    root.join(BACKLOG_DIR)
}

pub fn backlog_ticket(root: &Path, ticket_id: &str) -> PathBuf {
    backlog_dir(root).join(format!("{ticket_id}.md"))
}

pub fn reports_dir(root: &Path) -> PathBuf {
    root.join(REPORTS_DIR)
}

pub fn qa_dir(root: &Path) -> PathBuf {
    root.join(QA_DIR)
}

pub fn merge_dir(root: &Path) -> PathBuf {
    root.join(MERGE_DIR)
}

pub fn gates_dir(root: &Path) -> PathBuf {
    root.join(GATES_DIR)
}

pub fn queue_dir(root: &Path) -> PathBuf {
    root.join(QUEUE_DIR)
}

pub fn history_dir(root: &Path) -> PathBuf {
    root.join(HISTORY_DIR)
}

pub fn baseline_path(root: &Path) -> PathBuf {
    gates_dir(root).join(BASELINE_FILE)
}

pub fn gate_config_path(root: &Path) -> PathBuf {
    gates_dir(root).join(GATE_CONFIG_FILE)
}

pub fn runner_lock_path(root: &Path) -> PathBuf {
    root.join(RUNNER_LOCK_FILE)
}

pub fn data_lock_path(root: &Path) -> PathBuf {
    root.join(DATA_LOCK_FILE)
}

pub fn snapshot_path(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(RELEASE_DIR)
        .join(format!("readiness_snapshot_{}.json", date.format("%Y-%m-%d")))
}

/// Step artifacts live flat in the gates directory, keyed by run id.
pub fn step_log_path(root: &Path, run_id: &str) -> PathBuf {
    gates_dir(root).join(format!("{run_id}.log"))
}

pub fn step_meta_path(root: &Path, run_id: &str) -> PathBuf {
    gates_dir(root).join(format!("{run_id}.meta"))
}

pub fn step_baseline_eval_path(root: &Path, run_id: &str) -> PathBuf {
    gates_dir(root).join(format!("{run_id}.baseline.json"))
}

/// Make a ticket id safe to embed in a file name.
pub fn sanitize_ticket(ticket_id: &str) -> String {
    ticket_id.replace(['/', ' '], "_")
}
