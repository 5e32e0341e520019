use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of a single scheduled job invocation.
///
/// Errors are caught at the job boundary by the scheduler, logged, and
/// recorded in the job status; the job is retried on its next tick.
#[derive(Debug, Error)]
pub enum JobError {
    /// A level requested upstream data that has not settled yet.
    #[error("level {level}: upstream data not settled (requested up to {requested}, settled {settled:?})")]
    RefreshLagExceeded {
        level: String,
        requested: DateTime<Utc>,
        settled: Option<DateTime<Utc>>,
    },

    /// The leaderboard changed between snapshot and commit.
    #[error("leaderboard changed during merge (expected version {expected}, found {found})")]
    MergeConflict { expected: u64, found: u64 },

    /// No runtime configuration record is present.
    #[error("runtime configuration record is missing")]
    ConfigMissing,

    /// Transient store failure (persistence I/O).
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Run was still going at the next tick and the job cancels on overrun.
    #[error("run cancelled after exceeding its interval")]
    Cancelled,
}

/// Stable label for a [`JobError`], used in logs, metrics and the job surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RefreshLagExceeded,
    MergeConflict,
    ConfigMissing,
    StoreUnavailable,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RefreshLagExceeded => "refresh_lag_exceeded",
            Self::MergeConflict => "merge_conflict",
            Self::ConfigMissing => "config_missing",
            Self::StoreUnavailable => "store_unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RefreshLagExceeded { .. } => ErrorKind::RefreshLagExceeded,
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::ConfigMissing => ErrorKind::ConfigMissing,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Reason an event was rejected at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("entity key is empty")]
    EmptyKey,

    #[error("entity key is {len} bytes, limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("entity key contains whitespace or control characters")]
    InvalidKey,

    #[error("ingest queue is full")]
    QueueFull,

    #[error("ingest queue is closed")]
    Closed,
}

impl IngestError {
    /// Metric label for the rejection reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptyKey => "empty_key",
            Self::KeyTooLong { .. } => "key_too_long",
            Self::InvalidKey => "invalid_key",
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}
