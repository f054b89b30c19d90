//! Process liveness and signal delivery for the stop command.
//!
//! Staged escalation (SIGTERM, grace period, SIGKILL) with exit
//! verification by polling.

use std::thread;
use std::time::{Duration, Instant};

use labstats_common::InstanceId;
use thiserror::Error;

/// Signal delivery failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("process {0} not found")]
    NotFound(InstanceId),

    #[error("permission denied signalling process {0}")]
    PermissionDenied(InstanceId),

    #[error("signalling process {pid} failed: {detail}")]
    Failed { pid: InstanceId, detail: String },

    #[error("signals are not supported on this platform")]
    Unsupported,
}

/// Escalation timing.
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Grace period after SIGTERM before escalating to SIGKILL.
    pub term_grace: Duration,
    /// How long to wait for the process to vanish after SIGKILL.
    pub kill_wait: Duration,
    /// Polling interval when waiting for process to exit.
    pub poll_interval: Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// What forced termination observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running under that pid.
    NotRunning,
    /// Exited after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Still present after SIGKILL, or could not be signalled.
    Survived,
}

/// Send a signal to a process.
#[cfg(unix)]
pub fn send_signal(pid: InstanceId, signal: i32) -> Result<(), SignalError> {
    let raw = match i32::try_from(pid.0) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(SignalError::NotFound(pid)),
    };

    let result = unsafe { libc::kill(raw, signal) };
    if result == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(SignalError::NotFound(pid)),
        Some(libc::EPERM) => Err(SignalError::PermissionDenied(pid)),
        _ => Err(SignalError::Failed {
            pid,
            detail: err.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: InstanceId, _signal: i32) -> Result<(), SignalError> {
    Err(SignalError::Unsupported)
}

/// Check if a process exists. Zombies count as gone.
#[cfg(unix)]
pub fn process_exists(pid: InstanceId) -> bool {
    let Ok(raw) = i32::try_from(pid.0) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(raw, 0) };
    let alive = if result == 0 {
        true
    } else {
        // EPERM means process exists but we can't signal it
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    };
    alive && process_state(pid) != Some('Z')
}

#[cfg(not(unix))]
pub fn process_exists(_pid: InstanceId) -> bool {
    false
}

/// Get process state from /proc/[pid]/stat.
#[cfg(target_os = "linux")]
fn process_state(pid: InstanceId) -> Option<char> {
    let content = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Format: pid (comm) state ...
    let comm_end = content.rfind(')')?;
    let after_comm = content.get(comm_end + 2..)?;
    after_comm.chars().next()
}

#[cfg(not(target_os = "linux"))]
fn process_state(_pid: InstanceId) -> Option<char> {
    None
}

/// Poll until `pid` is gone. `true` if it exited within `timeout`.
pub fn wait_for_exit(pid: InstanceId, timeout: Duration, poll_interval: Duration) -> bool {
    let start = Instant::now();
    loop {
        if !process_exists(pid) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(poll_interval);
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL if still present.
#[cfg(unix)]
pub fn terminate(pid: InstanceId, config: &EscalationConfig) -> Result<Termination, SignalError> {
    if !process_exists(pid) {
        return Ok(Termination::NotRunning);
    }

    // Stage 1: SIGTERM
    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => {}
        Err(SignalError::NotFound(_)) => return Ok(Termination::NotRunning),
        Err(e) => return Err(e),
    }
    if wait_for_exit(pid, config.term_grace, config.poll_interval) {
        return Ok(Termination::Terminated);
    }

    // Stage 2: SIGKILL (only if process still exists)
    match send_signal(pid, libc::SIGKILL) {
        Ok(()) => {}
        Err(SignalError::NotFound(_)) => return Ok(Termination::Terminated),
        Err(e) => return Err(e),
    }
    if wait_for_exit(pid, config.kill_wait, config.poll_interval) {
        Ok(Termination::Killed)
    } else {
        Ok(Termination::Survived)
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: InstanceId, _config: &EscalationConfig) -> Result<Termination, SignalError> {
    Err(SignalError::Unsupported)
}
