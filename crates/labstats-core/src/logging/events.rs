//! Event vocabulary for structured logging.
//!
//! Every event carries the correlation fields of a [`LogContext`] and a
//! [`Stage`]; the event name is the tracing target.

use labstats_common::InstanceId;
use serde::{Deserialize, Serialize};

/// Log levels as written to JSONL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Where in the daemon lifecycle an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup, configuration, daemonizing.
    Init,
    /// Fetching candidate records and stat groups.
    Fetch,
    /// Joining records with stat groups.
    Merge,
    /// Handing the batch to the upload sink.
    Upload,
    /// Sleeping between cycles.
    Wait,
    /// Stop requests, both sides.
    Stop,
    /// Marker cleanup on exit.
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Fetch => "fetch",
            Stage::Merge => "merge",
            Stage::Upload => "upload",
            Stage::Wait => "wait",
            Stage::Stop => "stop",
            Stage::Teardown => "teardown",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Daemon lifecycle
    pub const DAEMON_STARTING: &str = "daemon.starting";
    pub const DAEMON_DETACHED: &str = "daemon.detached";
    pub const DAEMON_STARTED: &str = "daemon.started";
    pub const DAEMON_STOPPED: &str = "daemon.stopped";

    // Cycle
    pub const CYCLE_STARTED: &str = "cycle.started";
    pub const CYCLE_FETCH_FAILED: &str = "cycle.fetch_failed";
    pub const CYCLE_STATS_FAILED: &str = "cycle.stats_failed";
    pub const CYCLE_RECORD_SKIPPED: &str = "cycle.record_skipped";
    pub const CYCLE_RECORD_DEGRADED: &str = "cycle.record_degraded";
    pub const CYCLE_UPLOAD_FAILED: &str = "cycle.upload_failed";
    pub const CYCLE_FINISHED: &str = "cycle.finished";
    pub const CYCLE_WAITING: &str = "cycle.waiting";

    // Stop protocol
    pub const STOP_REQUESTED: &str = "stop.requested";
    pub const STOP_OBSERVED: &str = "stop.observed";
    pub const STOP_WAITING: &str = "stop.waiting";
    pub const STOP_COMPLETED: &str = "stop.completed";
    pub const STOP_TIMED_OUT: &str = "stop.timed_out";
    pub const STOP_STALE: &str = "stop.stale";
    pub const STOP_FORCED: &str = "stop.forced";

    // Markers
    pub const MARKER_CLEANUP_FAILED: &str = "marker.cleanup_failed";

    // Config/init events
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_ERROR: &str = "config.error";
}

/// Correlation fields shared by every event of one process.
///
/// Passed explicitly into the supervisor, controller, and stop command
/// rather than read from a global.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Unique ID for this invocation.
    pub run_id: String,
    /// Host identifier.
    pub host_id: String,
    /// Daemon instance, once known. Changes after daemonizing.
    pub instance: Option<InstanceId>,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Instance id as a loggable value. `None` leaves the field out.
    pub fn instance_id(&self) -> Option<u32> {
        self.instance.map(|i| i.0)
    }
}
