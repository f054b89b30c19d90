//! Daemon lifecycle: detach, daemon marker, stop channel, teardown.
//!
//! A [`ProcessSupervisor`] owns the daemon marker of exactly one instance.
//! The stop channel is that instance's stop marker: the stop command (or
//! run-once mode) writes it, [`ProcessSupervisor::should_stop`] consumes it.
//! Teardown runs from `Drop`, so it happens on every exit path that unwinds.

use labstats_common::InstanceId;

use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::markers::{MarkerError, MarkerStore};

/// Markers left behind by teardown, if any.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub daemon_marker_removed: bool,
    pub stop_marker_removed: bool,
    pub errors: Vec<String>,
}

/// Lifecycle manager for one daemon instance.
#[derive(Debug)]
pub struct ProcessSupervisor {
    store: MarkerStore,
    instance: InstanceId,
    ctx: LogContext,
    torn_down: bool,
}

impl ProcessSupervisor {
    /// Start an instance: detach if asked, then write the daemon marker.
    ///
    /// With `daemonize`, only the final detached process returns from this
    /// call; the original and intermediate processes exit with status 0.
    /// `ctx` is updated with the identity of the process that returns.
    pub fn start(
        store: MarkerStore,
        daemonize: bool,
        ctx: &mut LogContext,
    ) -> Result<Self, labstats_common::Error> {
        if daemonize {
            log_event!(
                ctx,
                DEBUG,
                event_names::DAEMON_STARTING,
                Stage::Init,
                "Detaching from the controlling terminal"
            );
            detach()?;
            *ctx = ctx.clone().with_instance(InstanceId::current());
            log_event!(
                ctx,
                DEBUG,
                event_names::DAEMON_DETACHED,
                Stage::Init,
                "Running detached"
            );
        } else {
            *ctx = ctx.clone().with_instance(InstanceId::current());
        }

        let mut supervisor = Self::for_instance(store, InstanceId::current(), ctx.clone());
        if let Err(e) = supervisor.create_marker() {
            // Nothing of ours exists yet; skip teardown.
            supervisor.torn_down = true;
            return Err(e.into());
        }
        Ok(supervisor)
    }

    /// Supervisor for an explicit identity, without detaching or writing
    /// anything.
    pub fn for_instance(store: MarkerStore, instance: InstanceId, ctx: LogContext) -> Self {
        let ctx = ctx.with_instance(instance);
        ProcessSupervisor {
            store,
            instance,
            ctx,
            torn_down: false,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn store(&self) -> &MarkerStore {
        &self.store
    }

    /// Write this instance's daemon marker.
    pub fn create_marker(&self) -> Result<(), MarkerError> {
        let path = self.store.create_daemon_marker(self.instance)?;
        log_event!(
            self.ctx,
            INFO,
            event_names::DAEMON_STARTED,
            Stage::Init,
            format!("Daemon marker written to {}", path.display())
        );
        Ok(())
    }

    /// True iff a stop was requested; consumes the request.
    ///
    /// A stop marker that exists but cannot be removed still counts as a
    /// request, so a permission problem cannot keep the loop alive.
    pub fn should_stop(&self) -> bool {
        match self.store.take_stop(self.instance) {
            Ok(found) => found,
            Err(e) => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::MARKER_CLEANUP_FAILED,
                    Stage::Stop,
                    e.to_string()
                );
                self.store.has_stop_marker(self.instance)
            }
        }
    }

    /// Ask this instance to stop after the current step.
    pub fn request_stop(&self) -> Result<(), MarkerError> {
        self.store.request_stop(self.instance)
    }

    /// Remove the daemon marker and any leftover stop marker.
    ///
    /// Errors are logged and collected, never returned; the process is on its
    /// way out. Only the first call does anything.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.torn_down = true;

        match self.store.remove_stop_marker(self.instance) {
            Ok(removed) => report.stop_marker_removed = removed,
            Err(e) => report.errors.push(e.to_string()),
        }
        match self.store.remove_daemon_marker(self.instance) {
            Ok(removed) => report.daemon_marker_removed = removed,
            Err(e) => report.errors.push(e.to_string()),
        }

        for error in &report.errors {
            log_event!(
                self.ctx,
                WARN,
                event_names::MARKER_CLEANUP_FAILED,
                Stage::Teardown,
                error.as_str()
            );
        }
        log_event!(
            self.ctx,
            INFO,
            event_names::DAEMON_STOPPED,
            Stage::Teardown,
            "Daemon stopped",
            stop_marker_removed = report.stop_marker_removed
        );
        report
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Double-fork detach.
///
/// Must be called while the process is single threaded: before any HTTP
/// agent or metrics server exists.
#[cfg(unix)]
fn detach() -> Result<(), labstats_common::Error> {
    // First fork: the parent returns to the shell.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error().into()),
        0 => {}
        _ => std::process::exit(0),
    }

    // New session: become session leader, lose the controlling terminal.
    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    // Second fork: the daemon is not a session leader and can never
    // reacquire a controlling terminal.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error().into()),
        0 => {}
        _ => std::process::exit(0),
    }

    std::env::set_current_dir("/")?;
    Ok(())
}

#[cfg(not(unix))]
fn detach() -> Result<(), labstats_common::Error> {
    Err(labstats_common::Error::Configuration(
        "daemonizing is only supported on unix; run with --daemonize=false under a service manager"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir, pid: u32) -> ProcessSupervisor {
        ProcessSupervisor::for_instance(
            MarkerStore::new(dir.path().join("markers")),
            InstanceId(pid),
            LogContext::new("run-test", "host-test"),
        )
    }

    #[test]
    fn start_in_foreground_writes_own_marker() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path().join("markers"));
        let mut ctx = LogContext::new("run-test", "host-test");

        let supervisor = ProcessSupervisor::start(store.clone(), false, &mut ctx).unwrap();
        assert_eq!(supervisor.instance(), InstanceId::current());
        assert_eq!(ctx.instance, Some(InstanceId::current()));
        assert!(store.has_daemon_marker(InstanceId::current()));

        drop(supervisor);
        assert!(!store.has_daemon_marker(InstanceId::current()));
    }

    #[test]
    fn should_stop_consumes_request() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, 1001);
        assert!(!sup.should_stop());

        sup.request_stop().unwrap();
        sup.request_stop().unwrap();
        assert!(sup.should_stop());
        assert!(!sup.should_stop());
    }

    #[test]
    fn teardown_removes_both_markers_once() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, 1002);
        sup.create_marker().unwrap();
        sup.request_stop().unwrap();

        let report = sup.teardown();
        assert!(report.daemon_marker_removed);
        assert!(report.stop_marker_removed);
        assert!(report.errors.is_empty());
        assert!(sup.store().list_instances().unwrap().is_empty());

        // Second call is inert.
        assert_eq!(sup.teardown(), TeardownReport::default());
    }

    #[test]
    fn teardown_tolerates_missing_markers() {
        let dir = TempDir::new().unwrap();
        let mut sup = supervisor(&dir, 1003);
        let report = sup.teardown();
        assert!(!report.daemon_marker_removed);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn start_fails_when_marker_dir_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("markers");
        std::fs::write(&blocker, "not a directory").unwrap();
        let mut ctx = LogContext::new("run-test", "host-test");

        let err =
            ProcessSupervisor::start(MarkerStore::new(&blocker), false, &mut ctx).unwrap_err();
        assert_eq!(err.category(), labstats_common::ErrorCategory::Resource);
    }
}
