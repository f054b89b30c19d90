//! Error types for the labstats daemon.
//!
//! The taxonomy decides what happens to a failure, not just how it prints:
//!
//! - **Configuration**: missing or invalid settings. Fatal before any marker
//!   is created.
//! - **Collaborator**: the spot API, monitoring service, or upload sink was
//!   unreachable or answered with an error. Degrades or skips the current
//!   cycle; the next cycle is the retry.
//! - **Record**: one record could not be merged. Only that record degrades.
//! - **Resource**: a marker file or directory could not be created or
//!   removed. Fatal at start, logged and ignored at teardown.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::id::SpotId;

/// Result type alias for labstats operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Collaborator,
    Record,
    Resource,
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Collaborator => write!(f, "collaborator"),
            ErrorCategory::Record => write!(f, "record"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Per-record merge failure. Degrades the one record it names.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("spot {spot} has no labstats_id in extended_info")]
    MissingJoinKey { spot: SpotId },

    #[error("spot {spot} has a non-string labstats_id: {value}")]
    InvalidJoinKey { spot: SpotId, value: String },

    #[error("no labstats group named {group:?} for spot {spot}")]
    NoMatchingGroup { spot: SpotId, group: String },

    #[error("labstats group {group:?} reported invalid counts: {detail}")]
    InvalidCounts { group: String, detail: String },

    /// A candidate entry that could not be read at all. It is not uploaded.
    #[error("candidate {spot} could not be read: {detail}")]
    MalformedCandidate { spot: String, detail: String },
}

/// Unified error type for the labstats daemon.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("cannot {action} {}: {source}", path.display())]
    Resource {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable error code, grouped by category:
    /// - 10-19: Configuration
    /// - 20-29: Collaborator
    /// - 30-39: Record
    /// - 40-49: Resource
    /// - 60-69: I/O
    pub fn code(&self) -> u32 {
        match self {
            Error::Configuration(_) => 10,
            Error::Collaborator(_) => 20,
            Error::Record(_) => 30,
            Error::Resource { .. } => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration(_) => ErrorCategory::Config,
            Error::Collaborator(_) => ErrorCategory::Collaborator,
            Error::Record(_) => ErrorCategory::Record,
            Error::Resource { .. } => ErrorCategory::Resource,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Whether the daemon keeps running after this error.
    ///
    /// Only collaborator and record failures are absorbed by the loop;
    /// everything else aborts startup.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Collaborator(_) | Error::Record(_))
    }

    /// Human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Configuration(_) => {
                "Set the missing value in daemon.toml \
                 or the matching LABSTATS_* environment variable."
            }
            Error::Collaborator(_) => {
                "Nothing to do; the next cycle retries. Check the service if this repeats."
            }
            Error::Record(_) => {
                "Fix the spot's document or the labstats group data; \
                 the record was uploaded without labstats fields, or skipped if unreadable."
            }
            Error::Resource { .. } => {
                "Check that the marker directory is writable by this user \
                 and not owned by someone else."
            }
            Error::Io(_) => "Check disk space and permissions, then retry.",
            Error::Json(_) => "A record could not be serialized; report it with the spot id.",
        }
    }

    pub fn resource(
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::Resource {
            action,
            path: path.into(),
            source,
        }
    }
}
