//! The reconciliation loop.
//!
//! Each cycle: check for a stop request, fetch candidates, fetch group
//! stats, merge, upload, then wait out the update delay one tick at a time
//! with a stop check before every tick. Collaborator and record failures are
//! logged and folded into the [`CycleReport`]; the next cycle is the retry.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use labstats_common::UploadItem;
use serde::{Deserialize, Serialize};

use crate::collab::{SpotSource, StatsSource, UploadSink};
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::merge::merge_records;
use crate::supervisor::ProcessSupervisor;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default delay between cycles, in minutes.
pub const DEFAULT_UPDATE_DELAY_MINUTES: f64 = 5.0;

/// Loop timing and mode.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between the end of one cycle and the start of the next.
    pub update_delay: Duration,
    /// Stop-check granularity during the wait.
    pub poll_tick: Duration,
    /// Run exactly one cycle, then stop.
    pub run_once: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            update_delay: Duration::from_secs(300),
            poll_tick: Duration::from_secs(1),
            run_once: false,
        }
    }
}

impl ControllerConfig {
    pub fn new(update_delay: Duration, run_once: bool) -> Self {
        Self {
            update_delay,
            run_once,
            ..Self::default()
        }
    }

    /// Number of stop-checked ticks in one wait: `ceil(delay / tick)`.
    pub fn wait_ticks(&self) -> u64 {
        let tick = self.poll_tick.as_nanos().max(1);
        let delay = self.update_delay.as_nanos();
        let ticks = delay.div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

/// Fractional minutes to a delay. Rejects negative, NaN and infinite input.
pub fn delay_from_minutes(minutes: f64) -> Result<Duration, String> {
    if !minutes.is_finite() || minutes < 0.0 {
        return Err(format!(
            "update delay must be a non-negative number of minutes, got {}",
            minutes
        ));
    }
    Duration::try_from_secs_f64(minutes * 60.0).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Every record merged against fresh stats and uploaded.
    Complete,
    /// Stats were unavailable; records were uploaded without labstats fields.
    Degraded,
    /// Some items were rejected by the upload sink.
    PartialUpload,
    /// The upload sink failed for the whole batch.
    UploadFailed,
    /// Candidate fetch failed; nothing was uploaded.
    FetchFailed,
    /// No candidates; nothing to upload.
    Empty,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Complete => "complete",
            CycleOutcome::Degraded => "degraded",
            CycleOutcome::PartialUpload => "partial_upload",
            CycleOutcome::UploadFailed => "upload_failed",
            CycleOutcome::FetchFailed => "fetch_failed",
            CycleOutcome::Empty => "empty",
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one fetch/merge/upload pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: String,
    pub candidates: usize,
    /// Candidate entries that could not be read and were left out.
    pub skipped: usize,
    pub augmented: usize,
    pub degraded: usize,
    pub uploaded: usize,
    pub upload_failures: usize,
    /// Collaborators that failed this cycle (`spot_api`, `monitoring`, `upload`).
    pub collaborator_errors: Vec<String>,
    pub outcome: CycleOutcome,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            started_at: Utc::now().to_rfc3339(),
            candidates: 0,
            skipped: 0,
            augmented: 0,
            degraded: 0,
            uploaded: 0,
            upload_failures: 0,
            collaborator_errors: Vec::new(),
            outcome: CycleOutcome::Empty,
            duration_ms: 0,
        }
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A stop marker was observed.
    Requested,
    /// Single-shot mode finished its cycle.
    RunOnce,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

type CycleObserver<'a> = Box<dyn FnMut(&CycleReport) + 'a>;

/// Drives cycles until a stop is requested.
pub struct PollingController<'a> {
    supervisor: &'a ProcessSupervisor,
    spots: &'a dyn SpotSource,
    stats: &'a dyn StatsSource,
    sink: &'a dyn UploadSink,
    config: ControllerConfig,
    ctx: LogContext,
    cycle: u64,
    observer: Option<CycleObserver<'a>>,
}

impl<'a> PollingController<'a> {
    pub fn new(
        supervisor: &'a ProcessSupervisor,
        spots: &'a dyn SpotSource,
        stats: &'a dyn StatsSource,
        sink: &'a dyn UploadSink,
        config: ControllerConfig,
        ctx: LogContext,
    ) -> Self {
        Self {
            supervisor,
            spots,
            stats,
            sink,
            config,
            ctx,
            cycle: 0,
            observer: None,
        }
    }

    /// Call `observer` with every finished cycle's report.
    pub fn with_observer(mut self, observer: impl FnMut(&CycleReport) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle
    }

    /// Run until stopped.
    pub fn run(&mut self) -> StopReason {
        loop {
            if self.supervisor.should_stop() {
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::STOP_OBSERVED,
                    Stage::Stop,
                    "Stop requested; leaving the loop",
                    cycles = self.cycle
                );
                return StopReason::Requested;
            }

            if self.config.run_once {
                // This cycle is the last; teardown clears the marker.
                if let Err(e) = self.supervisor.request_stop() {
                    log_event!(
                        self.ctx,
                        WARN,
                        event_names::MARKER_CLEANUP_FAILED,
                        Stage::Stop,
                        e.to_string()
                    );
                }
            }

            let report = self.run_cycle();
            if let Some(observer) = self.observer.as_mut() {
                observer(&report);
            }

            if self.config.run_once {
                return StopReason::RunOnce;
            }
            if self.wait() {
                log_event!(
                    self.ctx,
                    INFO,
                    event_names::STOP_OBSERVED,
                    Stage::Wait,
                    "Stop requested during wait",
                    cycles = self.cycle
                );
                return StopReason::Requested;
            }
        }
    }

    /// One fetch/merge/upload pass. Never fails; failures are in the report.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let started = Instant::now();
        let mut report = CycleReport::new(self.cycle);
        log_event!(
            self.ctx,
            DEBUG,
            event_names::CYCLE_STARTED,
            Stage::Fetch,
            "Cycle started",
            cycle = self.cycle
        );

        self.fill_report(&mut report);

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log_event!(
            self.ctx,
            INFO,
            event_names::CYCLE_FINISHED,
            Stage::Upload,
            format!("Cycle {} finished: {}", report.cycle, report.outcome),
            cycle = report.cycle,
            outcome = report.outcome.as_str(),
            candidates = report.candidates as u64,
            skipped = report.skipped as u64,
            augmented = report.augmented as u64,
            degraded = report.degraded as u64,
            uploaded = report.uploaded as u64,
            upload_failures = report.upload_failures as u64,
            duration_ms = report.duration_ms
        );
        report
    }

    fn fill_report(&self, report: &mut CycleReport) {
        let batch = match self.spots.fetch_candidates() {
            Ok(batch) => batch,
            Err(e) => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::CYCLE_FETCH_FAILED,
                    Stage::Fetch,
                    format!("Skipping cycle: {}", e)
                );
                report.collaborator_errors.push(e.source_name().to_string());
                report.outcome = CycleOutcome::FetchFailed;
                return;
            }
        };
        for error in &batch.rejected {
            log_event!(
                self.ctx,
                WARN,
                event_names::CYCLE_RECORD_SKIPPED,
                Stage::Fetch,
                error.to_string()
            );
        }
        report.skipped = batch.rejected.len();
        let candidates = batch.records;
        report.candidates = candidates.len();

        let groups = match self.stats.fetch_groups() {
            Ok(groups) => Some(groups),
            Err(e) => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::CYCLE_STATS_FAILED,
                    Stage::Fetch,
                    format!("Degrading all records: {}", e),
                    candidates = report.candidates as u64
                );
                report.collaborator_errors.push(e.source_name().to_string());
                None
            }
        };

        let merged = merge_records(candidates, groups.as_deref());
        for error in &merged.record_errors {
            log_event!(
                self.ctx,
                DEBUG,
                event_names::CYCLE_RECORD_DEGRADED,
                Stage::Merge,
                error.to_string()
            );
        }
        report.augmented = merged.augmented_count();
        report.degraded = merged.degraded_count();

        let mut items: Vec<UploadItem> = Vec::with_capacity(merged.merged.len());
        for record in &merged.merged {
            match record.to_upload_item() {
                Ok(item) => items.push(item),
                Err(e) => {
                    log_event!(
                        self.ctx,
                        WARN,
                        event_names::CYCLE_RECORD_DEGRADED,
                        Stage::Merge,
                        format!("Dropping spot {}: {}", record.id(), e)
                    );
                    report.upload_failures += 1;
                }
            }
        }

        if items.is_empty() {
            report.outcome = CycleOutcome::Empty;
            return;
        }

        match self.sink.upload(&items) {
            Ok(upload) => {
                for failure in &upload.failures {
                    log_event!(
                        self.ctx,
                        WARN,
                        event_names::CYCLE_UPLOAD_FAILED,
                        Stage::Upload,
                        format!("Upload of spot {} failed: {}", failure.id, failure.error)
                    );
                }
                report.uploaded = upload.uploaded;
                report.upload_failures += upload.failures.len();
                report.outcome = if !upload.failures.is_empty() {
                    CycleOutcome::PartialUpload
                } else if !merged.stats_available {
                    CycleOutcome::Degraded
                } else {
                    CycleOutcome::Complete
                };
            }
            Err(e) => {
                log_event!(
                    self.ctx,
                    WARN,
                    event_names::CYCLE_UPLOAD_FAILED,
                    Stage::Upload,
                    format!("Batch upload failed: {}", e),
                    items = items.len() as u64
                );
                report.collaborator_errors.push(e.source_name().to_string());
                report.upload_failures += items.len();
                report.outcome = CycleOutcome::UploadFailed;
            }
        }
    }

    /// Sleep out the update delay. `true` if a stop was requested.
    fn wait(&self) -> bool {
        let ticks = self.config.wait_ticks();
        log_event!(
            self.ctx,
            DEBUG,
            event_names::CYCLE_WAITING,
            Stage::Wait,
            "Waiting for next cycle",
            delay_secs = self.config.update_delay.as_secs_f64()
        );
        for _ in 0..ticks {
            if self.supervisor.should_stop() {
                return true;
            }
            thread::sleep(self.config.poll_tick);
        }
        false
    }
}
