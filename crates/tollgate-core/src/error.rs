use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TollgateError {
    #[error("unsupported gate mode: {0} (expected TICKET or MERGE)")]
    UnsupportedMode(String),

    #[error("workdir does not exist: {}", .0.display())]
    WorkdirMissing(PathBuf),

    #[error("invalid scoped test command '{command}': {reason}")]
    InvalidScopedCommand { command: String, reason: String },

    #[error("invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("lock busy: {}", .0.display())]
    LockBusy(PathBuf),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("snapshot not found: {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid queue record in {}: {reason}", .path.display())]
    CorruptQueue { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TollgateError {
    /// Configuration errors are raised before any job is created or run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TollgateError::UnsupportedMode(_)
                | TollgateError::WorkdirMissing(_)
                | TollgateError::InvalidScopedCommand { .. }
                | TollgateError::InvalidDate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TollgateError>;
