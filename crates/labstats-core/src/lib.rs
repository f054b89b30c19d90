//! Labstats Reconciliation Daemon Library
//!
//! This library provides the pieces the `labstats` binary wires together:
//! - Exit codes for CLI operations
//! - Structured logging with per-process correlation context
//! - Marker files, the process supervisor, and the stop command
//! - The merge step and the polling controller
//! - HTTP collaborators for the spot API and the monitoring service
//!
//! The binary entry point is in `main.rs`.

pub mod collab;
pub mod controller;
pub mod exit_codes;
pub mod logging;
pub mod markers;
pub mod merge;
pub mod process;
pub mod stop;
pub mod supervisor;

// Prometheus endpoint (optional, behind "metrics" feature)
#[cfg(feature = "metrics")]
pub mod metrics;
