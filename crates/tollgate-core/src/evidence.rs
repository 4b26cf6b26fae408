//! Evidence loading: reduce every artifact source to "latest record per ticket".

use crate::artifact::{file_modified, ArtifactReader, MarkdownArtifact};
use crate::error::Result;
use crate::paths;
use crate::types::GateMode;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fields consulted, in priority order, for a record's timestamp. The file
/// modification time is used when none of them parse.
pub const TIMESTAMP_KEYS: &[&str] = &["finished_at", "submitted_at", "report_date", "date"];

// ---------------------------------------------------------------------------
// EvidenceKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Backlog,
    Report,
    Qa,
    Merge,
    GateHistory,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::Backlog => "backlog",
            EvidenceKind::Report => "report",
            EvidenceKind::Qa => "qa",
            EvidenceKind::Merge => "merge",
            EvidenceKind::GateHistory => "gate_history",
        }
    }

    /// Templates, READMEs, and protocol documents that live beside evidence
    /// but never describe a ticket.
    pub fn is_excluded(self, file_name: &str) -> bool {
        match self {
            EvidenceKind::Backlog | EvidenceKind::Report => file_name == "README.md",
            EvidenceKind::Qa => matches!(
                file_name,
                "README.md" | "checklist_template.md" | "signoff_protocol.md"
            ),
            EvidenceKind::Merge => file_name == "README.md" || file_name.starts_with("merge_order_"),
            EvidenceKind::GateHistory => false,
        }
    }
}

// ---------------------------------------------------------------------------
// EvidenceRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceRecord {
    pub ticket_id: String,
    pub fields: BTreeMap<String, String>,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl EvidenceRecord {
    /// Build a record from normalized fields. Returns `None` when the fields
    /// carry no usable `ticket_id`.
    pub fn new(
        fields: BTreeMap<String, String>,
        path: PathBuf,
        fallback: DateTime<Utc>,
    ) -> Option<Self> {
        let ticket_id = fields.get("ticket_id")?.trim().to_string();
        if ticket_id.is_empty() {
            return None;
        }
        let timestamp = record_timestamp(&fields, fallback);
        Some(Self {
            ticket_id,
            fields,
            path,
            timestamp,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

pub type EvidenceMap = BTreeMap<String, EvidenceRecord>;

/// Insert `record` unless an existing record for the same ticket is strictly
/// newer. Equal timestamps favor the later-encountered record.
pub fn keep_latest(map: &mut EvidenceMap, record: EvidenceRecord) {
    match map.get(&record.ticket_id) {
        Some(current) if record.timestamp < current.timestamp => {
            tracing::debug!(
                ticket = %record.ticket_id,
                path = %record.path.display(),
                "older evidence superseded"
            );
        }
        _ => {
            map.insert(record.ticket_id.clone(), record);
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse RFC 3339, naive ISO date-times (assumed UTC), and plain dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

pub fn record_timestamp(fields: &BTreeMap<String, String>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    TIMESTAMP_KEYS
        .iter()
        .filter_map(|key| fields.get(*key))
        .find_map(|raw| parse_timestamp(raw))
        .unwrap_or(fallback)
}

// ---------------------------------------------------------------------------
// Gate history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GateHistoryEvidence {
    /// Latest history record per ticket, any mode.
    pub latest: EvidenceMap,
    /// Latest TICKET-mode history record per ticket.
    pub latest_ticket_mode: EvidenceMap,
}

/// Flatten the top-level scalars of a JSON object into string fields.
pub fn flatten_json_fields(value: &serde_json::Value) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    if let Some(obj) = value.as_object() {
        for (key, v) in obj {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            fields.insert(key.clone(), s);
        }
    }
    fields
}

// ---------------------------------------------------------------------------
// EvidenceLoader
// ---------------------------------------------------------------------------

pub struct EvidenceLoader<'a, R: ArtifactReader> {
    root: &'a Path,
    reader: &'a R,
}

impl<'a, R: ArtifactReader> EvidenceLoader<'a, R> {
    pub fn new(root: &'a Path, reader: &'a R) -> Self {
        Self { root, reader }
    }

    pub fn load(&self, kind: EvidenceKind) -> Result<EvidenceMap> {
        match kind {
            EvidenceKind::Backlog => self.load_markdown(kind, &paths::backlog_dir(self.root), None),
            EvidenceKind::Qa => self.load_markdown(kind, &paths::qa_dir(self.root), None),
            EvidenceKind::Merge => self.load_markdown(kind, &paths::merge_dir(self.root), None),
            EvidenceKind::Report => self.load_reports(),
            EvidenceKind::GateHistory => Ok(self.load_gate_history()?.latest),
        }
    }

    fn load_markdown(
        &self,
        kind: EvidenceKind,
        dir: &Path,
        default_agent: Option<&str>,
    ) -> Result<EvidenceMap> {
        let mut latest = EvidenceMap::new();
        self.fold_markdown(kind, dir, default_agent, &mut latest)?;
        Ok(latest)
    }

    fn fold_markdown(
        &self,
        kind: EvidenceKind,
        dir: &Path,
        default_agent: Option<&str>,
        latest: &mut EvidenceMap,
    ) -> Result<()> {
        for artifact in self.reader.read_dir(dir)? {
            if kind.is_excluded(artifact.file_name()) {
                continue;
            }
            if let Some(record) = markdown_record(artifact, default_agent) {
                keep_latest(latest, record);
            }
        }
        Ok(())
    }

    /// Reports are grouped one directory per agent.
    fn load_reports(&self) -> Result<EvidenceMap> {
        let reports_root = paths::reports_dir(self.root);
        let mut latest = EvidenceMap::new();
        if !reports_root.is_dir() {
            return Ok(latest);
        }
        let mut agent_dirs: Vec<PathBuf> = std::fs::read_dir(&reports_root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        agent_dirs.sort();
        for dir in agent_dirs {
            let agent = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.fold_markdown(EvidenceKind::Report, &dir, Some(&agent), &mut latest)?;
        }
        Ok(latest)
    }

    pub fn load_gate_history(&self) -> Result<GateHistoryEvidence> {
        let dir = paths::history_dir(self.root);
        let mut out = GateHistoryEvidence::default();
        if !dir.is_dir() {
            return Ok(out);
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        for path in files {
            let payload: serde_json::Value = match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unparsable gate history");
                    continue;
                }
            };
            let fields = flatten_json_fields(&payload);
            let is_ticket_mode = fields
                .get("mode")
                .and_then(|m| m.parse::<GateMode>().ok())
                == Some(GateMode::Ticket);
            let fallback = file_modified(&path);
            let Some(record) = EvidenceRecord::new(fields, path, fallback) else {
                continue;
            };
            if is_ticket_mode {
                keep_latest(&mut out.latest_ticket_mode, record.clone());
            }
            keep_latest(&mut out.latest, record);
        }
        Ok(out)
    }
}

fn markdown_record(artifact: MarkdownArtifact, default_agent: Option<&str>) -> Option<EvidenceRecord> {
    let MarkdownArtifact {
        path,
        modified,
        mut metadata,
        ..
    } = artifact;
    if let Some(agent) = default_agent {
        metadata
            .entry("agent".to_string())
            .or_insert_with(|| agent.to_string());
    }
    EvidenceRecord::new(metadata, path, modified)
}

// ---------------------------------------------------------------------------
// EvidenceSet
// ---------------------------------------------------------------------------

/// Every evidence source for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSet {
    pub backlog: EvidenceMap,
    pub reports: EvidenceMap,
    pub qa: EvidenceMap,
    pub merge: EvidenceMap,
    pub gates: GateHistoryEvidence,
}

impl EvidenceSet {
    pub fn load<R: ArtifactReader>(root: &Path, reader: &R) -> Result<Self> {
        let loader = EvidenceLoader::new(root, reader);
        Ok(Self {
            backlog: loader.load(EvidenceKind::Backlog)?,
            reports: loader.load(EvidenceKind::Report)?,
            qa: loader.load(EvidenceKind::Qa)?,
            merge: loader.load(EvidenceKind::Merge)?,
            gates: loader.load_gate_history()?,
        })
    }
}
