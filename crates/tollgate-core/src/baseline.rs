//! Known-failure allowlist for MERGE-mode full test runs.

use crate::error::Result;
use crate::io::{write_if_missing, write_json_pretty};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const BASELINE_NOTES: &str = "Known pre-existing full-test failures eligible for merge waiver.";

fn failure_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^----\s+(.+?)\s+stdout\s+----\s*$").unwrap())
}

fn failure_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s{4}([A-Za-z0-9_:]+)\s*$").unwrap())
}

// ---------------------------------------------------------------------------
// Allowlist file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaselineEntry {
    Id(String),
    Detailed {
        #[serde(default)]
        test_id: String,
    },
}

impl BaselineEntry {
    fn test_id(&self) -> &str {
        match self {
            BaselineEntry::Id(id) => id.trim(),
            BaselineEntry::Detailed { test_id } => test_id.trim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineFile {
    #[serde(default)]
    pub known_failures: Vec<BaselineEntry>,
    #[serde(default)]
    pub notes: String,
}

impl Default for BaselineFile {
    fn default() -> Self {
        Self {
            known_failures: Vec::new(),
            notes: BASELINE_NOTES.to_string(),
        }
    }
}

/// Create an empty allowlist at `path` if none exists.
pub fn ensure_baseline(path: &Path) -> Result<bool> {
    let mut data = serde_json::to_string_pretty(&BaselineFile::default())?;
    data.push('\n');
    write_if_missing(path, data.as_bytes())
}

/// Allow-listed test identifiers. A missing file is an empty allowlist.
pub fn load_baseline(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let data = std::fs::read_to_string(path)?;
    let file: BaselineFile = serde_json::from_str(&data)?;
    Ok(file
        .known_failures
        .iter()
        .map(BaselineEntry::test_id)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}

// ---------------------------------------------------------------------------
// Log parsing
// ---------------------------------------------------------------------------

/// Failing test identifiers from cargo test output, first-seen order, no duplicates.
pub fn parse_failures(log: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut in_failures = false;

    for line in log.lines() {
        if let Some(caps) = failure_block_re().captures(line) {
            found.push(caps[1].trim().to_string());
            continue;
        }
        if line.trim() == "failures:" {
            in_failures = true;
            continue;
        }
        if in_failures {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(caps) = failure_list_re().captures(line) {
                found.push(caps[1].trim().to_string());
                continue;
            }
            if !line.starts_with("    ") {
                in_failures = false;
            }
        }
    }

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEvaluation {
    pub evaluated_at: DateTime<Utc>,
    pub log_file: PathBuf,
    pub baseline_file: PathBuf,
    pub failure_count: usize,
    pub failures: Vec<String>,
    pub known_failures: Vec<String>,
    pub new_failures: Vec<String>,
    /// True only when at least one failure was found and every one is allow-listed.
    pub only_known_failures: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

pub fn classify_failures(
    failures: Vec<String>,
    baseline: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let (mut known, mut new): (Vec<String>, Vec<String>) =
        failures.iter().cloned().partition(|f| baseline.contains(f));
    known.sort();
    new.sort();
    (failures, known, new)
}

/// Compare the failures in `log_file` against the allowlist and, when `out`
/// is given, persist the evaluation there.
pub fn evaluate(log_file: &Path, baseline_file: &Path, out: Option<&Path>) -> Result<BaselineEvaluation> {
    let bytes = std::fs::read(log_file)?;
    let log = String::from_utf8_lossy(&bytes);
    let baseline = load_baseline(baseline_file)?;
    let (failures, known, new) = classify_failures(parse_failures(&log), &baseline);

    let evaluation = BaselineEvaluation {
        evaluated_at: Utc::now(),
        log_file: log_file.to_path_buf(),
        baseline_file: baseline_file.to_path_buf(),
        failure_count: failures.len(),
        only_known_failures: !failures.is_empty() && new.is_empty(),
        failures,
        known_failures: known,
        new_failures: new,
        artifact: out.map(Path::to_path_buf),
    };
    if let Some(out) = out {
        write_json_pretty(out, &evaluation)?;
    }
    tracing::info!(
        failures = evaluation.failure_count,
        new = evaluation.new_failures.len(),
        waivable = evaluation.only_known_failures,
        "baseline evaluation"
    );
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CARGO_LOG: &str = "\
running 3 tests
test net::tests::ok ... ok
test net::tests::flaky ... FAILED
test db::tests::slow ... FAILED

failures:

---- net::tests::flaky stdout ----
thread 'net::tests::flaky' panicked at src/net.rs:10:5:
assertion failed

---- db::tests::slow stdout ----
thread 'db::tests::slow' panicked at src/db.rs:4:5:
timeout

failures:
    net::tests::flaky
    db::tests::slow

test result: FAILED. 1 passed; 2 failed; 0 ignored
";

    #[test]
    fn parses_blocks_and_list_without_duplicates() {
        assert_eq!(
            parse_failures(CARGO_LOG),
            vec!["net::tests::flaky", "db::tests::slow"]
        );
        assert!(parse_failures("test result: ok. 3 passed").is_empty());
    }

    #[test]
    fn failures_section_ends_at_unindented_line() {
        let log = "failures:\n    a::one\nsummary\n    a::two\n";
        assert_eq!(parse_failures(log), vec!["a::one"]);
    }

    #[test]
    fn baseline_accepts_strings_and_objects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baseline.json");
        std::fs::write(
            &path,
            r#"{"known_failures": ["a::one", {"test_id": " b::two ", "reason": "flaky"}, {"reason": "x"}, ""], "notes": "n"}"#,
        )
        .unwrap();
        let ids = load_baseline(&path).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["a::one", "b::two"]);
    }

    #[test]
    fn ensure_baseline_creates_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gates/baseline_failures.json");
        assert!(ensure_baseline(&path).unwrap());
        assert!(!ensure_baseline(&path).unwrap());
        let file: BaselineFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(file.known_failures.is_empty());
        assert_eq!(file.notes, BASELINE_NOTES);
        assert!(load_baseline(&dir.path().join("missing.json")).unwrap().is_empty());
    }

    #[test]
    fn only_known_failures_waivable() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("test.log");
        let baseline = dir.path().join("baseline.json");
        let out = dir.path().join("eval.json");
        std::fs::write(&log, CARGO_LOG).unwrap();

        std::fs::write(
            &baseline,
            r#"{"known_failures": ["net::tests::flaky", "db::tests::slow"]}"#,
        )
        .unwrap();
        let eval = evaluate(&log, &baseline, Some(&out)).unwrap();
        assert!(eval.only_known_failures);
        assert_eq!(eval.known_failures, vec!["db::tests::slow", "net::tests::flaky"]);
        assert!(out.exists());

        std::fs::write(&baseline, r#"{"known_failures": ["net::tests::flaky"]}"#).unwrap();
        let eval = evaluate(&log, &baseline, None).unwrap();
        assert!(!eval.only_known_failures);
        assert_eq!(eval.new_failures, vec!["db::tests::slow"]);
    }

    #[test]
    fn no_parsed_failures_is_not_waivable() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("test.log");
        std::fs::write(&log, "error[E0425]: cannot find value\n").unwrap();
        let eval = evaluate(&log, &dir.path().join("none.json"), None).unwrap();
        assert_eq!(eval.failure_count, 0);
        assert!(!eval.only_known_failures);
    }
}
