//! Prometheus metrics endpoint for the run command.
//!
//! Exposes cycle metrics at `/metrics` in Prometheus exposition format from
//! a background thread. Only built with the `metrics` feature and only
//! started when `--metrics-addr` is given.
//!
//! ## Metrics
//!
//! **Counters:**
//! - `labstats_cycles_total`: cycles by outcome
//! - `labstats_records_total`: records by result (augmented/degraded/skipped)
//! - `labstats_uploads_total`: uploaded items by result (ok/failed)
//! - `labstats_collaborator_errors_total`: failures by collaborator
//!
//! **Gauges:**
//! - `labstats_daemon_uptime_seconds`
//! - `labstats_last_cycle_timestamp`: unix time of the last finished cycle
//!
//! **Histograms:**
//! - `labstats_cycle_duration_seconds`

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::controller::CycleReport;

/// Prometheus metrics for the reconciliation loop.
#[derive(Clone)]
pub struct DaemonMetrics {
    pub registry: Registry,

    // Counters
    pub cycles_total: IntCounterVec,
    pub records_total: IntCounterVec,
    pub uploads_total: IntCounterVec,
    pub collaborator_errors_total: IntCounterVec,

    // Gauges
    pub daemon_uptime_seconds: IntGauge,
    pub last_cycle_timestamp: Gauge,

    // Histograms
    pub cycle_duration_seconds: HistogramVec,

    started_at: Instant,
}

impl DaemonMetrics {
    /// Create a new metrics collection and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cycles_total = IntCounterVec::new(
            Opts::new("labstats_cycles_total", "Reconciliation cycles by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let records_total = IntCounterVec::new(
            Opts::new("labstats_records_total", "Merged records by result"),
            &["result"],
        )?;
        registry.register(Box::new(records_total.clone()))?;

        let uploads_total = IntCounterVec::new(
            Opts::new("labstats_uploads_total", "Uploaded items by result"),
            &["result"],
        )?;
        registry.register(Box::new(uploads_total.clone()))?;

        let collaborator_errors_total = IntCounterVec::new(
            Opts::new(
                "labstats_collaborator_errors_total",
                "Collaborator failures by collaborator",
            ),
            &["collaborator"],
        )?;
        registry.register(Box::new(collaborator_errors_total.clone()))?;

        let daemon_uptime_seconds =
            IntGauge::new("labstats_daemon_uptime_seconds", "Daemon uptime in seconds")?;
        registry.register(Box::new(daemon_uptime_seconds.clone()))?;

        let last_cycle_timestamp = Gauge::new(
            "labstats_last_cycle_timestamp",
            "Unix timestamp of the last finished cycle",
        )?;
        registry.register(Box::new(last_cycle_timestamp.clone()))?;

        let cycle_duration_seconds = HistogramVec::new(
            HistogramOpts::new("labstats_cycle_duration_seconds", "Cycle duration in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;

        let build_info = IntGauge::with_opts(
            Opts::new("labstats_build_info", "Build information")
                .const_label("version", env!("CARGO_PKG_VERSION")),
        )?;
        build_info.set(1);
        registry.register(Box::new(build_info))?;

        Ok(Self {
            registry,
            cycles_total,
            records_total,
            uploads_total,
            collaborator_errors_total,
            daemon_uptime_seconds,
            last_cycle_timestamp,
            cycle_duration_seconds,
            started_at: Instant::now(),
        })
    }

    /// Fold one cycle report into the counters.
    pub fn record_cycle(&self, report: &CycleReport) {
        let outcome = report.outcome.as_str();
        self.cycles_total.with_label_values(&[outcome]).inc();
        self.records_total
            .with_label_values(&["augmented"])
            .inc_by(report.augmented as u64);
        self.records_total
            .with_label_values(&["degraded"])
            .inc_by(report.degraded as u64);
        self.records_total
            .with_label_values(&["skipped"])
            .inc_by(report.skipped as u64);
        self.uploads_total
            .with_label_values(&["ok"])
            .inc_by(report.uploaded as u64);
        self.uploads_total
            .with_label_values(&["failed"])
            .inc_by(report.upload_failures as u64);
        for collaborator in &report.collaborator_errors {
            self.collaborator_errors_total
                .with_label_values(&[collaborator.as_str()])
                .inc();
        }
        self.cycle_duration_seconds
            .with_label_values(&[outcome])
            .observe(report.duration_ms as f64 / 1000.0);
        self.last_cycle_timestamp
            .set(chrono::Utc::now().timestamp() as f64);
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.daemon_uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Handle to the running metrics HTTP server.
pub struct MetricsServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Start the metrics HTTP server on a background thread.
    ///
    /// Must not be called before daemonizing; the thread would not survive
    /// the fork.
    pub fn start(addr: SocketAddr, metrics: DaemonMetrics) -> Result<Self, String> {
        let server = tiny_http::Server::http(addr)
            .map_err(|e| format!("failed to start metrics server on {}: {}", addr, e))?;
        let addr = server.server_addr().to_ip().unwrap_or(addr);

        info!(addr = %addr, "metrics server started");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let thread = thread::Builder::new()
            .name("labstats-metrics".to_string())
            .spawn(move || {
                serve_loop(server, &metrics, &shutdown_clone);
            })
            .map_err(|e| format!("failed to spawn metrics thread: {}", e))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            addr,
        })
    }

    /// Get the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = std::net::TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Accept requests, serve /metrics, reject everything else.
fn serve_loop(server: tiny_http::Server, metrics: &DaemonMetrics, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let request = match server.recv_timeout(Duration::from_secs(1)) {
            Ok(Some(req)) => req,
            Ok(None) => continue,
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!(error = %e, "metrics server accept error");
                }
                break;
            }
        };

        if shutdown.load(Ordering::SeqCst) {
            let _ = request
                .respond(tiny_http::Response::from_string("shutting down").with_status_code(503));
            break;
        }

        let url = request.url().to_string();
        debug!(method = %request.method(), url = %url, "metrics scrape");

        if url == "/metrics" || url == "/metrics/" {
            match metrics.render() {
                Ok(body) => {
                    let mut response = tiny_http::Response::from_string(body);
                    let content_type = "Content-Type: text/plain; version=0.0.4; charset=utf-8";
                    if let Ok(header) = content_type.parse::<tiny_http::Header>() {
                        response = response.with_header(header);
                    }
                    if let Err(e) = request.respond(response) {
                        warn!(error = %e, "failed to send metrics response");
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to render metrics");
                    let _ = request.respond(
                        tiny_http::Response::from_string(format!("error: {}", e))
                            .with_status_code(500),
                    );
                }
            }
        } else if url == "/health" || url == "/healthz" {
            let _ = request.respond(tiny_http::Response::from_string("ok"));
        } else {
            let _ = request
                .respond(tiny_http::Response::from_string("not found").with_status_code(404));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::CycleOutcome;
    use std::io::{Read, Write};

    fn report(outcome: CycleOutcome) -> CycleReport {
        CycleReport {
            cycle: 1,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            candidates: 3,
            skipped: 0,
            augmented: 2,
            degraded: 1,
            uploaded: 3,
            upload_failures: 0,
            collaborator_errors: Vec::new(),
            outcome,
            duration_ms: 250,
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = DaemonMetrics::new().unwrap();
        assert!(metrics.render().unwrap().contains("labstats_build_info"));
    }

    #[test]
    fn test_record_cycle() {
        let metrics = DaemonMetrics::new().unwrap();
        metrics.record_cycle(&report(CycleOutcome::Complete));
        let mut degraded = report(CycleOutcome::Degraded);
        degraded.collaborator_errors.push("monitoring".into());
        metrics.record_cycle(&degraded);

        let output = metrics.render().unwrap();
        assert!(output.contains("labstats_cycles_total{outcome=\"complete\"} 1"));
        assert!(output.contains("labstats_cycles_total{outcome=\"degraded\"} 1"));
        assert!(output.contains("labstats_records_total{result=\"augmented\"} 4"));
        assert!(
            output.contains("labstats_collaborator_errors_total{collaborator=\"monitoring\"} 1")
        );
        assert!(output.contains("labstats_cycle_duration_seconds_count{outcome=\"complete\"} 1"));
    }

    #[test]
    fn test_server_serves_metrics() {
        let metrics = DaemonMetrics::new().unwrap();
        metrics.record_cycle(&report(CycleOutcome::Complete));
        let server = MetricsServer::start("127.0.0.1:0".parse().unwrap(), metrics).unwrap();

        let mut stream = std::net::TcpStream::connect(server.addr()).unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("labstats_cycles_total"));
    }
}
