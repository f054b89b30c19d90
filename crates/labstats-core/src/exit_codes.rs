//! Exit codes for the labstats CLI.
//!
//! Exit codes communicate operation outcome without requiring output parsing.
//! `stop` uses them as its primary success signal for automation.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

use labstats_common::{Error, ErrorCategory};

/// Exit codes for labstats operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success: daemon ran to a requested stop, or every instance stopped
    Clean = 0,

    /// A graceful stop did not complete within the timeout
    StopTimedOut = 1,

    /// Invalid arguments
    ArgsError = 10,

    /// Missing or invalid settings
    ConfigError = 11,

    /// Marker directory or file could not be created or removed
    ResourceError = 12,

    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Check if this exit code is a user/environment error (codes 10-19).
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::StopTimedOut => "ERR_STOP_TIMEOUT",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::ResourceError => "ERR_RESOURCE",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }

    /// Exit code for an error that aborted a command.
    pub fn for_error(err: &Error) -> Self {
        match err.category() {
            ErrorCategory::Config => ExitCode::ConfigError,
            ErrorCategory::Resource => ExitCode::ResourceError,
            ErrorCategory::Io => ExitCode::IoError,
            // Cycle-level errors never abort a command.
            ErrorCategory::Collaborator | ErrorCategory::Record => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
