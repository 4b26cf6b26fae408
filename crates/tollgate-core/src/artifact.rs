//! Markdown artifact reading.
//!
//! Tickets, reports, QA signoffs, and merge manifests are markdown files
//! written by agents. The reconciler only needs two things from them: a flat
//! metadata mapping with normalized keys, and the bullets under a named
//! heading. [`ArtifactReader`] is the seam; [`MarkdownReader`] is the
//! default implementation over a directory of `*.md` files.

use crate::error::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// MarkdownArtifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MarkdownArtifact {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub text: String,
}

impl MarkdownArtifact {
    pub fn from_text(path: impl Into<PathBuf>, modified: DateTime<Utc>, text: String) -> Self {
        Self {
            path: path.into(),
            modified,
            metadata: parse_metadata(&text),
            text,
        }
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Bullet items listed under the heading titled `title`.
    pub fn section(&self, title: &str) -> Vec<String> {
        parse_section_bullets(&self.text, title)
    }
}

// ---------------------------------------------------------------------------
// ArtifactReader
// ---------------------------------------------------------------------------

pub trait ArtifactReader {
    /// Every markdown artifact directly inside `dir`, in lexical path order.
    /// A missing directory yields no artifacts.
    fn read_dir(&self, dir: &Path) -> Result<Vec<MarkdownArtifact>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownReader;

impl ArtifactReader for MarkdownReader {
    fn read_dir(&self, dir: &Path) -> Result<Vec<MarkdownArtifact>> {
        let mut artifacts = Vec::new();
        for path in markdown_files(dir)? {
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable artifact");
                    continue;
                }
            };
            let modified = file_modified(&path);
            let text = String::from_utf8_lossy(&bytes).into_owned();
            artifacts.push(MarkdownArtifact::from_text(path, modified, text));
        }
        Ok(artifacts)
    }
}

/// Filesystem modification time as UTC, or the epoch if unavailable.
pub fn file_modified(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

pub fn markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

static KV_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
static HEADING_RE: OnceLock<Regex> = OnceLock::new();
static BULLET_RE: OnceLock<Regex> = OnceLock::new();
static WS_RE: OnceLock<Regex> = OnceLock::new();

fn kv_patterns() -> &'static [Regex] {
    KV_PATTERNS.get_or_init(|| {
        [
            r"^\s*[-*]\s*\*\*([A-Za-z0-9 _/()\-]+):\*\*\s*(.*?)\s*$",
            r"^\s*\*\*([A-Za-z0-9 _/()\-]+):\*\*\s*(.*?)\s*$",
            r"^\s*[-*]\s*(?:\*\*)?([A-Za-z0-9 _/()\-]+?)(?:\*\*)?:\s*(.*?)\s*$",
            r"^\s*\*\*([A-Za-z0-9 _/()\-]+?)\*\*:\s*(.*?)\s*$",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn heading_re() -> &'static Regex {
    HEADING_RE.get_or_init(|| Regex::new(r"^#{1,6}\s+(.*)$").unwrap())
}

fn bullet_re() -> &'static Regex {
    BULLET_RE.get_or_init(|| Regex::new(r"^\s*-\s+(.*\S)\s*$").unwrap())
}

fn ws_re() -> &'static Regex {
    WS_RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// `Ticket ID` → `ticket_id`, `` `QA/Owner` `` → `qa_owner`.
pub fn normalize_key(key: &str) -> String {
    let cleaned = key.trim().replace('`', "");
    let cleaned = ws_re().replace_all(&cleaned, " ");
    cleaned.to_lowercase().replace([' ', '/'], "_")
}

pub fn parse_kv_line(line: &str) -> Option<(String, String)> {
    for pattern in kv_patterns() {
        let Some(caps) = pattern.captures(line) else {
            continue;
        };
        let key = normalize_key(&caps[1]);
        let value = caps[2].trim().to_string();
        if !key.is_empty() && !value.is_empty() {
            return Some((key, value));
        }
    }
    None
}

fn heading_title(line: &str) -> Option<String> {
    heading_re()
        .captures(line)
        .map(|caps| caps[1].trim().to_lowercase())
}

fn is_level_two_heading(line: &str) -> bool {
    line.strip_prefix("##")
        .and_then(|rest| rest.chars().next())
        .is_some_and(char::is_whitespace)
}

/// Metadata from the `## Metadata` section, else the preamble before the
/// first `##` heading, else the whole file.
pub fn parse_metadata(text: &str) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    let mut in_metadata = false;
    let mut saw_metadata = false;

    for line in text.lines() {
        if let Some(title) = heading_title(line) {
            if in_metadata && title != "metadata" {
                break;
            }
            in_metadata = title == "metadata";
            saw_metadata |= in_metadata;
            continue;
        }
        if in_metadata {
            if let Some((k, v)) = parse_kv_line(line) {
                meta.insert(k, v);
            }
        }
    }
    if !meta.is_empty() || saw_metadata {
        return meta;
    }

    for line in text.lines() {
        if is_level_two_heading(line) {
            break;
        }
        if let Some((k, v)) = parse_kv_line(line) {
            meta.insert(k, v);
        }
    }
    if !meta.is_empty() {
        return meta;
    }

    text.lines().filter_map(parse_kv_line).collect()
}

pub fn parse_section_bullets(text: &str, section_title: &str) -> Vec<String> {
    let wanted = section_title.trim().to_lowercase();
    let mut in_section = false;
    let mut values = Vec::new();

    for line in text.lines() {
        if let Some(title) = heading_title(line) {
            if in_section && title != wanted {
                break;
            }
            in_section = title == wanted;
            continue;
        }
        if in_section {
            if let Some(caps) = bullet_re().captures(line) {
                values.push(caps[1].to_string());
            }
        }
    }
    values
}
