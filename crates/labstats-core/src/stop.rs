//! Stop command: find running instances and end them.
//!
//! The graceful path writes each instance's stop marker and waits for its
//! daemon marker to disappear. The forced path signals the process directly
//! (SIGTERM, then SIGKILL) and then removes whatever markers are left,
//! whether or not the process was still there.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use labstats_common::InstanceId;
use serde::Serialize;

use crate::exit_codes::ExitCode;
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::markers::{MarkerError, MarkerStore};
use crate::process::{self, EscalationConfig, Termination};

/// Default graceful-stop timeout.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct StopOptions {
    /// Signal instead of asking.
    pub force: bool,
    /// Log progress at info instead of debug.
    pub verbose: bool,
    /// How long a graceful stop waits per instance.
    pub timeout: Duration,
    /// Marker polling interval while waiting.
    pub poll_interval: Duration,
    pub escalation: EscalationConfig,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            force: false,
            verbose: false,
            timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: Duration::from_millis(250),
            escalation: EscalationConfig::default(),
        }
    }
}

/// What happened to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum InstanceOutcome {
    /// The instance tore itself down after the stop request.
    Stopped,
    /// The marker named a process that no longer exists; markers removed.
    Stale,
    /// The daemon marker was still present when the timeout ran out.
    TimedOut,
    /// The stop marker could not be written.
    RequestFailed { error: String },
    /// Forced path; markers were cleaned up afterwards.
    Forced { termination: String },
}

impl InstanceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            InstanceOutcome::TimedOut | InstanceOutcome::RequestFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStop {
    pub instance: InstanceId,
    pub outcome: InstanceOutcome,
}

/// Result of one stop invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub instances: Vec<InstanceStop>,
}

impl StopReport {
    /// 0 when every instance stopped (or none were found), 1 otherwise.
    pub fn exit_code(&self) -> ExitCode {
        if self.instances.iter().any(|i| i.outcome.is_failure()) {
            ExitCode::StopTimedOut
        } else {
            ExitCode::Clean
        }
    }
}

/// Liveness of one discovered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub instance: InstanceId,
    pub alive: bool,
    pub stop_requested: bool,
    pub marker: PathBuf,
}

/// Every instance with a daemon marker, with liveness.
pub fn instance_status(store: &MarkerStore) -> Result<Vec<InstanceStatus>, MarkerError> {
    Ok(store
        .list_instances()?
        .into_iter()
        .map(|instance| InstanceStatus {
            instance,
            alive: process::process_exists(instance),
            stop_requested: store.has_stop_marker(instance),
            marker: store.daemon_path(instance),
        })
        .collect())
}

pub struct StopCommand {
    store: MarkerStore,
    options: StopOptions,
    ctx: LogContext,
}

impl StopCommand {
    pub fn new(store: MarkerStore, options: StopOptions, ctx: LogContext) -> Self {
        Self { store, options, ctx }
    }

    /// Stop every discovered instance.
    ///
    /// Only enumerating the marker directory can fail; per-instance problems
    /// end up in the report.
    pub fn run(&self) -> Result<StopReport, MarkerError> {
        let instances = self.store.list_instances()?;
        if instances.is_empty() {
            log_event!(
                self.ctx,
                INFO,
                event_names::STOP_COMPLETED,
                Stage::Stop,
                format!("No running instances under {}", self.store.dir().display())
            );
        }

        let mut report = StopReport::default();
        for instance in instances {
            let outcome = if self.options.force {
                self.stop_forced(instance)
            } else {
                self.stop_graceful(instance)
            };
            report.instances.push(InstanceStop { instance, outcome });
        }
        Ok(report)
    }

    /// Ask via the stop marker and wait for the daemon marker to go away.
    pub fn stop_graceful(&self, instance: InstanceId) -> InstanceOutcome {
        let ctx = self.ctx.clone().with_instance(instance);

        if !process::process_exists(instance) {
            self.cleanup(&ctx, instance);
            log_event!(
                ctx,
                INFO,
                event_names::STOP_STALE,
                Stage::Stop,
                format!("Instance {} is not running; removed its markers", instance)
            );
            return InstanceOutcome::Stale;
        }

        if let Err(e) = self.store.request_stop(instance) {
            log_event!(
                ctx,
                ERROR,
                event_names::STOP_REQUESTED,
                Stage::Stop,
                e.to_string()
            );
            return InstanceOutcome::RequestFailed {
                error: e.to_string(),
            };
        }
        log_event!(
            ctx,
            INFO,
            event_names::STOP_REQUESTED,
            Stage::Stop,
            format!("Requested stop of instance {}", instance)
        );

        let started = Instant::now();
        let mut last_report = Instant::now();
        loop {
            if !self.store.has_daemon_marker(instance) {
                // Teardown may have run before our request landed.
                if let Err(e) = self.store.remove_stop_marker(instance) {
                    log_event!(
                        ctx,
                        WARN,
                        event_names::MARKER_CLEANUP_FAILED,
                        Stage::Stop,
                        e.to_string()
                    );
                }
                log_event!(
                    ctx,
                    INFO,
                    event_names::STOP_COMPLETED,
                    Stage::Stop,
                    format!("Instance {} stopped", instance),
                    waited_ms = started.elapsed().as_millis() as u64
                );
                return InstanceOutcome::Stopped;
            }
            if !process::process_exists(instance) {
                // Died without tearing down.
                self.cleanup(&ctx, instance);
                log_event!(
                    ctx,
                    WARN,
                    event_names::STOP_STALE,
                    Stage::Stop,
                    format!("Instance {} exited without removing its marker", instance)
                );
                return InstanceOutcome::Stale;
            }
            if started.elapsed() >= self.options.timeout {
                log_event!(
                    ctx,
                    WARN,
                    event_names::STOP_TIMED_OUT,
                    Stage::Stop,
                    format!(
                        "Instance {} still running after {}s; retry with --force",
                        instance,
                        self.options.timeout.as_secs()
                    )
                );
                return InstanceOutcome::TimedOut;
            }
            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                let message = format!("Waiting for instance {} to stop", instance);
                if self.options.verbose {
                    log_event!(ctx, INFO, event_names::STOP_WAITING, Stage::Stop, message);
                } else {
                    log_event!(ctx, DEBUG, event_names::STOP_WAITING, Stage::Stop, message);
                }
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Signal, then remove leftover markers regardless of the result.
    pub fn stop_forced(&self, instance: InstanceId) -> InstanceOutcome {
        let ctx = self.ctx.clone().with_instance(instance);
        let termination = match process::terminate(instance, &self.options.escalation) {
            Ok(Termination::NotRunning) => "not_running".to_string(),
            Ok(Termination::Terminated) => "terminated".to_string(),
            Ok(Termination::Killed) => "killed".to_string(),
            Ok(Termination::Survived) => "survived".to_string(),
            Err(e) => {
                log_event!(
                    ctx,
                    DEBUG,
                    event_names::STOP_FORCED,
                    Stage::Stop,
                    e.to_string()
                );
                "signal_failed".to_string()
            }
        };
        self.cleanup(&ctx, instance);
        log_event!(
            ctx,
            INFO,
            event_names::STOP_FORCED,
            Stage::Stop,
            format!("Forced stop of instance {}: {}", instance, termination)
        );
        InstanceOutcome::Forced { termination }
    }

    /// Best-effort removal of both markers; failures are only logged.
    fn cleanup(&self, ctx: &LogContext, instance: InstanceId) {
        let results = [
            self.store.remove_stop_marker(instance),
            self.store.remove_daemon_marker(instance),
        ];
        for result in results {
            if let Err(e) = result {
                log_event!(
                    ctx,
                    DEBUG,
                    event_names::MARKER_CLEANUP_FAILED,
                    Stage::Stop,
                    e.to_string()
                );
            }
        }
    }
}
