use crate::baseline::BaselineEvaluation;
use crate::error::{Result, TollgateError};
use crate::paths::sanitize_ticket;
use crate::types::{GateMode, JobStatus, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Effective exit code recorded for a step stopped by a signal.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One gate run. Identity and inputs are fixed at enqueue; only the runner
/// writes `status`, `steps`, and the timestamps after that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub ticket_id: String,
    pub mode: GateMode,
    pub workdir: PathBuf,
    pub branch: String,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub scoped_test_command: String,
    pub status: JobStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_file: Option<PathBuf>,
}

impl Job {
    pub fn new(
        ticket_id: impl Into<String>,
        mode: GateMode,
        workdir: PathBuf,
        branch: impl Into<String>,
        submitted_by: impl Into<String>,
        scoped_test_command: impl Into<String>,
    ) -> Self {
        let ticket_id = ticket_id.into();
        Self {
            job_id: make_job_id(mode, &ticket_id),
            ticket_id,
            mode,
            workdir,
            branch: branch.into(),
            submitted_by: submitted_by.into(),
            submitted_at: Utc::now(),
            scoped_test_command: scoped_test_command.into(),
            status: JobStatus::Queued,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
            error: None,
            history_file: None,
        }
    }

    /// Move into the terminal `status`, stamping the finish time.
    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn exit_code(&self) -> i32 {
        if self.status.is_passing() {
            0
        } else {
            1
        }
    }

    pub fn interrupted_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Interrupted)
            .count()
    }
}

/// `<stamp>_<mode>_<ticket>_<pid>_<micros>_<seq>`. The sequence keeps ids
/// unique for enqueues within the same microsecond of one process.
pub fn make_job_id(mode: GateMode, ticket_id: &str) -> String {
    let now = Utc::now();
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}_{}_{}_{}_{}_{}",
        now.format("%Y%m%dT%H%M%SZ"),
        mode.as_str().to_lowercase(),
        sanitize_ticket(ticket_id),
        std::process::id(),
        now.timestamp_micros().rem_euclid(1_000_000),
        seq
    )
}

pub fn step_run_id(job_id: &str, step: &str) -> String {
    format!("{}_{job_id}_{step}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: StepStatus,
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub exit_code: i32,
    /// Differs from `exit_code` only for waived or interrupted steps.
    pub effective_exit_code: i32,
    pub artifacts: StepArtifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_waiver: Option<BaselineEvaluation>,
}

impl Step {
    pub fn passed(&self) -> bool {
        self.effective_exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepArtifacts {
    pub run_id: String,
    pub log_file: PathBuf,
    pub meta_file: PathBuf,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Scoped test commands
// ---------------------------------------------------------------------------

/// Split a command line into words, honoring single quotes, double quotes,
/// and backslash escapes the way a POSIX shell does.
pub fn split_words(raw: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Tool arguments for a scoped test run. One leading wrapper is stripped;
/// what remains must start with `test`.
pub fn parse_scoped_test(raw: &str, wrappers: &[String]) -> Result<Vec<String>> {
    let invalid = |reason: String| TollgateError::InvalidScopedCommand {
        command: raw.to_string(),
        reason,
    };

    let mut tokens = split_words(raw.trim()).map_err(invalid)?;
    if tokens.is_empty() {
        return Err(invalid("empty scoped test command".to_string()));
    }
    if wrappers.iter().any(|w| *w == tokens[0]) {
        tokens.remove(0);
    }
    match tokens.first().map(String::as_str) {
        None => Err(invalid("missing subcommand after wrapper".to_string())),
        Some("test") => Ok(tokens),
        Some(other) => Err(invalid(format!("must start with `test`, got `{other}`"))),
    }
}

/// Render a program and its arguments as a copy-pasteable shell line.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_word(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn wrappers() -> Vec<String> {
        vec!["cargo-safe".to_string(), "cargo".to_string()]
    }

    #[test]
    fn job_ids_are_unique_under_rapid_creation() {
        let ids: HashSet<String> = (0..500)
            .map(|_| make_job_id(GateMode::Ticket, "NB-T1"))
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn job_id_shape() {
        let id = make_job_id(GateMode::Merge, "team a/NB-T1");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0].len(), "20260217T120000Z".len());
        assert!(parts[0].ends_with('Z'));
        assert_eq!(parts[1], "merge");
        assert!(id.contains("_team_a_NB-T1_"));
        assert!(id.contains(&format!("_{}_", std::process::id())));
    }

    #[test]
    fn new_job_is_queued() {
        let job = Job::new("NB-T1", GateMode::Ticket, "/tmp".into(), "main", "me", "cargo test");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.steps.is_empty());
        assert_eq!(job.exit_code(), 1);

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["mode"], "TICKET");
        assert_eq!(json["status"], "QUEUED");
        assert!(json.get("finished_at").is_none());
    }

    #[test]
    fn split_words_handles_quotes() {
        assert_eq!(
            split_words(r#"cargo test -p core -- "two words" 'it''s' a\ b"#).unwrap(),
            vec!["cargo", "test", "-p", "core", "--", "two words", "its", "a b"]
        );
        assert_eq!(split_words("  ").unwrap(), Vec::<String>::new());
        assert_eq!(split_words(r#""""#).unwrap(), vec![""]);
        assert!(split_words("test 'open").is_err());
    }

    #[test]
    fn scoped_test_strips_one_wrapper() {
        assert_eq!(
            parse_scoped_test("cargo-safe test --lib", &wrappers()).unwrap(),
            vec!["test", "--lib"]
        );
        assert_eq!(
            parse_scoped_test("cargo test -p core it_works", &wrappers()).unwrap(),
            vec!["test", "-p", "core", "it_works"]
        );
        assert_eq!(parse_scoped_test("test", &wrappers()).unwrap(), vec!["test"]);
    }

    #[test]
    fn scoped_test_rejects_other_verbs() {
        for raw in ["", "cargo", "cargo build", "cargo-safe cargo test", "make test"] {
            let err = parse_scoped_test(raw, &wrappers()).unwrap_err();
            assert!(err.is_configuration(), "{raw}");
        }
    }

    #[test]
    fn display_command_quotes_when_needed() {
        let args = vec!["test".to_string(), "two words".to_string(), "it's".to_string()];
        assert_eq!(
            display_command("cargo", &args),
            r#"cargo test 'two words' 'it'\''s'"#
        );
    }
}
