//! Labstats reconciliation daemon
//!
//! The main entry point for the `labstats` binary, handling:
//! - `run`: detach, then fetch → merge → upload → wait until stopped
//! - `stop`: ask (or force) every running instance to shut down
//! - `status`: list instances found in the marker directory

use clap::{ArgAction, Args, Parser, Subcommand};
use labstats_config::{load_settings, validate_for_run, ConfigError, Settings};
use labstats_core::collab::monitoring::MonitoringClient;
use labstats_core::collab::spot_api::SpotApiClient;
use labstats_core::controller::{delay_from_minutes, ControllerConfig, PollingController};
use labstats_core::exit_codes::ExitCode;
use labstats_core::log_event;
use labstats_core::logging::{
    event_names, generate_run_id, get_host_id, init_logging, LogConfig, LogContext, LogFormat,
    LogLevel, Stage,
};
use labstats_core::markers::MarkerStore;
use labstats_core::stop::{instance_status, StopCommand, StopOptions};
use labstats_core::supervisor::ProcessSupervisor;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(feature = "metrics")]
use labstats_core::metrics::{DaemonMetrics, MetricsServer};
#[cfg(feature = "metrics")]
use std::net::SocketAddr;

/// Labstats reconciliation daemon - keeps spot records in sync with lab usage
#[derive(Parser)]
#[command(name = "labstats")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Settings file (default: LABSTATS_CONFIG, then XDG, then /etc/labstats)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log format on stderr: human or jsonl
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation daemon
    #[command(visible_alias = "run-daemon")]
    Run(RunArgs),

    /// Stop running daemon instances
    #[command(visible_alias = "stop-daemon")]
    Stop(StopArgs),

    /// List daemon instances found in the marker directory
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Detach from the terminal (--daemonize=false stays in the foreground)
    #[arg(
        long,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true",
        action = ArgAction::Set,
        value_name = "BOOL"
    )]
    daemonize: bool,

    /// Minutes between update attempts; fractions allowed
    #[arg(long, value_name = "MINUTES", default_value = "5", value_parser = parse_update_delay)]
    update_delay: Duration,

    /// Run exactly one cycle, then shut down
    #[arg(long)]
    run_once: bool,

    /// Per-request HTTP timeout in seconds (overrides settings)
    #[arg(long, value_name = "SECS")]
    request_timeout: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[cfg(feature = "metrics")]
    #[arg(long, value_name = "ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct StopArgs {
    /// Signal the processes instead of asking them to stop
    #[arg(long)]
    force: bool,

    /// Seconds to wait for each instance (overrides settings)
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Print JSON on stdout
    #[arg(long)]
    json: bool,
}

fn parse_update_delay(value: &str) -> Result<Duration, String> {
    let minutes: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("expected a number of minutes, got {value:?}"))?;
    delay_from_minutes(minutes)
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let mut ctx = LogContext::new(generate_run_id(), get_host_id());

    let exit_code = match &cli.command {
        Commands::Run(args) => run_daemon(&cli.global, args, &mut ctx),
        Commands::Stop(args) => run_stop(&cli.global, args, &ctx),
        Commands::Status(args) => run_status(&cli.global, args, &ctx),
    };

    std::process::exit(exit_code.as_i32());
}

/// Load settings; the run command validates further.
fn settings_or_exit(global: &GlobalOpts, ctx: &LogContext) -> Result<Settings, ExitCode> {
    match load_settings(global.config.as_deref()) {
        Ok((settings, resolved)) => {
            let source = resolved.source.to_string();
            let path = resolved
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            log_event!(
                ctx,
                DEBUG,
                event_names::CONFIG_LOADED,
                Stage::Init,
                "Settings loaded",
                source = source.as_str(),
                path = path.as_str()
            );
            Ok(settings)
        }
        Err(e) => Err(config_failure(ctx, e)),
    }
}

fn config_failure(ctx: &LogContext, err: ConfigError) -> ExitCode {
    let err = labstats_common::Error::from(err);
    log_event!(
        ctx,
        ERROR,
        event_names::CONFIG_ERROR,
        Stage::Init,
        err.to_string(),
        remediation = err.remediation()
    );
    ExitCode::for_error(&err)
}

fn run_daemon(global: &GlobalOpts, args: &RunArgs, ctx: &mut LogContext) -> ExitCode {
    let mut settings = match settings_or_exit(global, ctx) {
        Ok(settings) => settings,
        Err(code) => return code,
    };
    if let Some(secs) = args.request_timeout {
        settings.request_timeout_secs = secs;
    }
    let daemon = match validate_for_run(&settings) {
        Ok(daemon) => daemon,
        Err(e) => return config_failure(ctx, e.into()),
    };

    // Detaching changes the working directory to /.
    let marker_dir = absolute_marker_dir(&daemon.marker_dir);
    let store = MarkerStore::new(marker_dir);
    let supervisor = match ProcessSupervisor::start(store, args.daemonize, ctx) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            log_event!(
                ctx,
                ERROR,
                event_names::DAEMON_STARTING,
                Stage::Init,
                e.to_string(),
                remediation = e.remediation()
            );
            return ExitCode::for_error(&e);
        }
    };

    // HTTP agents and the metrics thread only exist in the detached process.
    let spot_api = SpotApiClient::from_settings(&daemon);
    let monitoring = MonitoringClient::from_settings(&daemon);

    let config = ControllerConfig::new(args.update_delay, args.run_once);
    let controller = PollingController::new(
        &supervisor,
        &spot_api,
        &monitoring,
        &spot_api,
        config,
        ctx.clone(),
    );

    #[cfg(feature = "metrics")]
    let (mut controller, _metrics_server) = attach_metrics(controller, args.metrics_addr, ctx);
    #[cfg(not(feature = "metrics"))]
    let mut controller = controller;

    let reason = controller.run();
    log_event!(
        ctx,
        DEBUG,
        event_names::STOP_OBSERVED,
        Stage::Teardown,
        format!("Polling loop finished ({reason:?})"),
        cycles = controller.cycles_run()
    );

    // Markers are removed when `supervisor` drops at the end of this scope.
    ExitCode::Clean
}

fn absolute_marker_dir(dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        return dir.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(dir),
        Err(_) => dir.to_path_buf(),
    }
}

#[cfg(feature = "metrics")]
fn attach_metrics<'a>(
    controller: PollingController<'a>,
    addr: Option<SocketAddr>,
    ctx: &LogContext,
) -> (PollingController<'a>, Option<MetricsServer>) {
    let Some(addr) = addr else {
        return (controller, None);
    };

    let started = DaemonMetrics::new()
        .map_err(|e| e.to_string())
        .and_then(|metrics| {
            MetricsServer::start(addr, metrics.clone()).map(|server| (metrics, server))
        });
    match started {
        Ok((metrics, server)) => {
            let controller = controller.with_observer(move |report| metrics.record_cycle(report));
            (controller, Some(server))
        }
        Err(e) => {
            log_event!(
                ctx,
                WARN,
                event_names::DAEMON_STARTED,
                Stage::Init,
                format!("Metrics endpoint disabled: {e}")
            );
            (controller, None)
        }
    }
}

fn run_stop(global: &GlobalOpts, args: &StopArgs, ctx: &LogContext) -> ExitCode {
    let settings = match settings_or_exit(global, ctx) {
        Ok(settings) => settings,
        Err(code) => return code,
    };

    let options = StopOptions {
        force: args.force,
        verbose: global.verbose > 0,
        timeout: Duration::from_secs(args.timeout.unwrap_or(settings.stop_timeout_secs)),
        ..StopOptions::default()
    };
    let store = MarkerStore::new(settings.marker_dir());
    let command = StopCommand::new(store, options, ctx.clone());

    match command.run() {
        Ok(report) => {
            let code = report.exit_code();
            log_event!(
                ctx,
                DEBUG,
                event_names::STOP_COMPLETED,
                Stage::Stop,
                format!("Stop finished: {code}"),
                instances = report.instances.len() as u64
            );
            code
        }
        Err(e) => {
            let err = labstats_common::Error::from(e);
            log_event!(
                ctx,
                ERROR,
                event_names::STOP_REQUESTED,
                Stage::Stop,
                err.to_string(),
                remediation = err.remediation()
            );
            ExitCode::for_error(&err)
        }
    }
}

fn run_status(global: &GlobalOpts, args: &StatusArgs, ctx: &LogContext) -> ExitCode {
    let settings = match settings_or_exit(global, ctx) {
        Ok(settings) => settings,
        Err(code) => return code,
    };
    let store = MarkerStore::new(settings.marker_dir());

    let instances = match instance_status(&store) {
        Ok(instances) => instances,
        Err(e) => {
            let err = labstats_common::Error::from(e);
            log_event!(
                ctx,
                ERROR,
                event_names::MARKER_CLEANUP_FAILED,
                Stage::Init,
                err.to_string()
            );
            return ExitCode::for_error(&err);
        }
    };

    if args.json {
        let output = serde_json::json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "marker_dir": store.dir().display().to_string(),
            "instances": instances,
        });
        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                let err = labstats_common::Error::from(e);
                eprintln!("labstats status: {err}");
                return ExitCode::for_error(&err);
            }
        }
    } else if instances.is_empty() {
        println!("No instances under {}", store.dir().display());
    } else {
        for status in &instances {
            let state = if status.alive { "alive" } else { "stale" };
            let stop = if status.stop_requested {
                " (stop requested)"
            } else {
                ""
            };
            println!("{:>8}  {}{}", status.instance.to_string(), state, stop);
        }
    }

    ExitCode::Clean
}
