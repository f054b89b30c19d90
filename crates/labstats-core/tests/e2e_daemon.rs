//! End-to-end tests for the run, stop and status commands.
//!
//! A tiny_http server stands in for both the spot API and the monitoring
//! service. Every test gets its own marker directory and settings file.

#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Put {
    path: String,
    if_match: Option<String>,
    body: Value,
}

struct FakeServer {
    base: String,
    puts: Arc<Mutex<Vec<Put>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FakeServer {
    /// Serve `candidates` from the spot API and `groups` (or a 500 when
    /// `None`) from the monitoring service.
    fn start(candidates: Value, groups: Option<Value>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fake server");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let puts = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let puts = puts.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let Ok(Some(request)) = server.recv_timeout(Duration::from_millis(50)) else {
                        continue;
                    };
                    respond(request, &candidates, groups.as_ref(), &puts);
                }
            })
        };

        FakeServer {
            base: format!("http://{addr}"),
            puts,
            shutdown,
            thread: Some(thread),
        }
    }

    fn puts(&self) -> Vec<Put> {
        self.puts.lock().unwrap().clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn respond(
    mut request: tiny_http::Request,
    candidates: &Value,
    groups: Option<&Value>,
    puts: &Mutex<Vec<Put>>,
) {
    let url = request.url().to_string();
    let method = request.method().clone();

    let (status, body) = match (&method, url.as_str()) {
        (tiny_http::Method::Get, u) if u.starts_with("/api/v1/spot/?") => {
            (200, candidates.to_string())
        }
        (tiny_http::Method::Get, "/groups") => match groups {
            Some(groups) => (200, groups.to_string()),
            None => (500, "monitoring unavailable".to_string()),
        },
        (tiny_http::Method::Get, u) if u.starts_with("/api/v1/spot/") => (200, "{}".to_string()),
        (tiny_http::Method::Put, u) if u.starts_with("/api/v1/spot/") => {
            let mut raw = String::new();
            let _ = request.as_reader().read_to_string(&mut raw);
            let if_match = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("If-Match"))
                .map(|h| h.value.as_str().to_string());
            puts.lock().unwrap().push(Put {
                path: u.to_string(),
                if_match,
                body: serde_json::from_str(&raw).unwrap_or(Value::Null),
            });
            (200, String::new())
        }
        _ => (404, String::new()),
    };

    let mut response = tiny_http::Response::from_string(body).with_status_code(status);
    if method == tiny_http::Method::Get && url.starts_with("/api/v1/spot/") && !url.contains('?') {
        let etag = tiny_http::Header::from_bytes(&b"ETag"[..], &b"\"etag-1\""[..]).unwrap();
        response = response.with_header(etag);
    }
    let _ = request.respond(response);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const LABSTATS_VARS: &[&str] = &[
    "LABSTATS_CONFIG",
    "LABSTATS_SERVER_HOST",
    "LABSTATS_OAUTH_KEY",
    "LABSTATS_OAUTH_SECRET",
    "LABSTATS_URL",
    "LABSTATS_REQUEST_TIMEOUT",
    "LABSTATS_MARKER_DIR",
    "LABSTATS_STOP_TIMEOUT",
    "LABSTATS_OAUTH_SIGNATURE_METHOD",
    "LABSTATS_LOG",
    "LABSTATS_LOG_FORMAT",
    "RUST_LOG",
];

struct Env {
    home: TempDir,
    config: PathBuf,
    markers: PathBuf,
}

impl Env {
    fn new(server_base: &str) -> Self {
        let home = TempDir::new().expect("tempdir");
        let markers = home.path().join("markers");
        let config = home.path().join("daemon.toml");
        let body = format!(
            "server_host = \"{server_base}\"\n\
             oauth_key = \"test-key\"\n\
             oauth_secret = \"test-secret\"\n\
             labstats_url = \"{server_base}/groups\"\n\
             request_timeout_secs = 5\n\
             stop_timeout_secs = 20\n\
             marker_dir = '{}'\n",
            markers.display()
        );
        fs::write(&config, body).expect("write config");
        Env {
            home,
            config,
            markers,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_labstats"));
        for var in LABSTATS_VARS {
            cmd.env_remove(var);
        }
        cmd.env("XDG_CONFIG_HOME", self.home.path());
        cmd.arg("--config").arg(&self.config);
        cmd.timeout(Duration::from_secs(60));
        cmd
    }

    /// Foreground daemon as a child process.
    fn spawn_daemon(&self, extra: &[&str]) -> Child {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_labstats"));
        for var in LABSTATS_VARS {
            cmd.env_remove(var);
        }
        cmd.env("XDG_CONFIG_HOME", self.home.path())
            .arg("--config")
            .arg(&self.config)
            .args(["run", "--daemonize=false"])
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn().expect("spawn daemon")
    }

    /// Default (detached) run. Returns the invoking process's pid and exit
    /// status; the daemon itself keeps running in the background.
    fn run_detached(&self, extra: &[&str]) -> (u32, Option<std::process::ExitStatus>) {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_labstats"));
        for var in LABSTATS_VARS {
            cmd.env_remove(var);
        }
        cmd.env("XDG_CONFIG_HOME", self.home.path())
            .arg("--config")
            .arg(&self.config)
            .arg("run")
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().expect("spawn run");
        let pid = child.id();
        (pid, wait_for_exit(&mut child, Duration::from_secs(10)))
    }

    /// Pids named by `<pid>.pid` markers.
    fn marker_pids(&self) -> Vec<u32> {
        self.marker_files()
            .iter()
            .filter_map(|name| name.strip_suffix(".pid")?.parse().ok())
            .collect()
    }

    fn daemon_marker(&self, pid: u32) -> PathBuf {
        self.markers.join(format!("{pid}.pid"))
    }

    fn stop_marker(&self, pid: u32) -> PathBuf {
        self.markers.join(format!("{pid}.stop"))
    }

    fn marker_files(&self) -> Vec<String> {
        match fs::read_dir(&self.markers) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    check()
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    None
}

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}

fn write_markers(markers: &Path, pid: u32, with_stop: bool) {
    fs::create_dir_all(markers).unwrap();
    fs::write(markers.join(format!("{pid}.pid")), pid.to_string()).unwrap();
    if with_stop {
        fs::write(markers.join(format!("{pid}.stop")), "").unwrap();
    }
}

fn lib101_candidates() -> Value {
    json!([{
        "id": 42,
        "name": "Odegaard 2nd floor",
        "extended_info": {
            "labstats_id": "LIB101",
            "has_labstats": "true",
            "auto_labstats_available": 9
        }
    }])
}

fn lib101_groups() -> Value {
    json!([{"groupName": "LIB101", "availableCount": 3, "totalCount": 10, "offCount": 1}])
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

mod run_once {
    use super::*;

    #[test]
    fn uploads_augmented_record_and_leaves_no_markers() {
        let server = FakeServer::start(lib101_candidates(), Some(lib101_groups()));
        let env = Env::new(&server.base);

        env.command()
            .args(["run", "--daemonize=false", "--run-once"])
            .assert()
            .success();

        let puts = server.puts();
        assert_eq!(puts.len(), 1, "{puts:?}");
        let put = &puts[0];
        assert_eq!(put.path, "/api/v1/spot/42");
        assert_eq!(put.if_match.as_deref(), Some("\"etag-1\""));
        let info = &put.body["extended_info"];
        assert_eq!(info["auto_labstats_available"], 3);
        assert_eq!(info["auto_labstats_total"], 10);
        assert_eq!(info["auto_labstats_off"], 1);
        assert_eq!(info["labstats_id"], "LIB101");
        assert_eq!(put.body["name"], "Odegaard 2nd floor");

        assert!(env.marker_files().is_empty(), "{:?}", env.marker_files());
    }

    #[test]
    fn stats_outage_uploads_degraded_records() {
        let server = FakeServer::start(lib101_candidates(), None);
        let env = Env::new(&server.base);

        env.command()
            .args(["run", "--daemonize=false", "--run-once"])
            .assert()
            .success();

        let puts = server.puts();
        assert_eq!(puts.len(), 1);
        let info = puts[0].body["extended_info"].as_object().unwrap();
        assert!(!info.contains_key("auto_labstats_available"));
        assert!(!info.contains_key("auto_labstats_total"));
        assert!(!info.contains_key("auto_labstats_off"));
        assert_eq!(info["labstats_id"], "LIB101");
        assert!(env.marker_files().is_empty());
    }

    #[test]
    fn unmatched_group_degrades_only_that_record() {
        let candidates = json!([
            {"id": 1, "extended_info": {"labstats_id": "LIB101"}},
            {"id": 2, "extended_info": {"labstats_id": "GONE", "auto_labstats_off": 4}}
        ]);
        let server = FakeServer::start(candidates, Some(lib101_groups()));
        let env = Env::new(&server.base);

        env.command()
            .args(["run", "--daemonize=false", "--run-once"])
            .assert()
            .success();

        let mut puts = server.puts();
        puts.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0].body["extended_info"]["auto_labstats_total"], 10);
        let degraded = puts[1].body["extended_info"].as_object().unwrap();
        assert!(!degraded.contains_key("auto_labstats_off"));
    }

    #[test]
    fn spot_api_outage_still_exits_cleanly() {
        // Nothing listens on the discard port.
        let env = Env::new("http://127.0.0.1:9");

        env.command()
            .args(["run", "--daemonize=false", "--run-once"])
            .assert()
            .success();

        assert!(env.marker_files().is_empty());
    }

    #[test]
    fn jsonl_logs_carry_cycle_events() {
        let server = FakeServer::start(lib101_candidates(), Some(lib101_groups()));
        let env = Env::new(&server.base);

        let output = env
            .command()
            .args(["--log-format", "jsonl", "run", "--daemonize=false", "--run-once"])
            .output()
            .expect("run");
        assert!(output.status.success());

        let stderr = String::from_utf8_lossy(&output.stderr);
        let events: Vec<Value> = stderr
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        assert!(events.iter().any(|e| e["event"] == "daemon.started"));
        assert!(events.iter().any(|e| e["event"] == "cycle.finished"));
        assert!(events.iter().any(|e| e["event"] == "daemon.stopped"));
        assert!(!stderr.contains("test-secret"));
    }
}

// ---------------------------------------------------------------------------
// Detached run
// ---------------------------------------------------------------------------

mod detached {
    use super::*;

    /// Kills a detached daemon that a failing test left behind, i.e. one
    /// whose marker is still present.
    struct Reaper {
        pid: u32,
        marker: PathBuf,
    }

    impl Drop for Reaper {
        fn drop(&mut self) {
            if self.marker.exists() {
                unsafe {
                    libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
    }

    #[test]
    fn invoker_returns_and_daemon_runs_under_new_pid() {
        let server = FakeServer::start(lib101_candidates(), Some(lib101_groups()));
        let env = Env::new(&server.base);

        let (invoker, status) = env.run_detached(&["--update-delay", "10"]);
        let status = status.expect("invoking process returned");
        assert!(status.success(), "{status:?}");

        assert!(
            wait_until(Duration::from_secs(15), || !env.marker_pids().is_empty()),
            "daemon marker never appeared"
        );
        let pids = env.marker_pids();
        assert_eq!(pids.len(), 1, "{pids:?}");
        let _reaper = Reaper {
            pid: pids[0],
            marker: env.daemon_marker(pids[0]),
        };
        assert_ne!(pids[0], invoker);

        env.command().arg("stop").assert().success();
        assert!(
            wait_until(Duration::from_secs(5), || env.marker_files().is_empty()),
            "{:?}",
            env.marker_files()
        );
    }

    #[test]
    fn run_once_detached_uploads_and_cleans_up() {
        let server = FakeServer::start(lib101_candidates(), Some(lib101_groups()));
        let env = Env::new(&server.base);

        let (_, status) = env.run_detached(&["--run-once"]);
        assert!(status.expect("invoking process returned").success());

        assert!(
            wait_until(Duration::from_secs(15), || server.puts().len() == 1),
            "no upload from the detached daemon"
        );
        assert!(
            wait_until(Duration::from_secs(5), || env.marker_files().is_empty()),
            "{:?}",
            env.marker_files()
        );
    }
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

mod stop {
    use super::*;

    #[test]
    fn graceful_stop_ends_running_daemon() {
        let server = FakeServer::start(lib101_candidates(), Some(lib101_groups()));
        let env = Env::new(&server.base);
        let mut daemon = env.spawn_daemon(&["--update-delay", "10"]);
        let pid = daemon.id();

        assert!(
            wait_until(Duration::from_secs(15), || env.daemon_marker(pid).exists()),
            "daemon marker never appeared"
        );

        env.command().arg("stop").assert().success();

        let status = wait_for_exit(&mut daemon, Duration::from_secs(10)).expect("daemon exited");
        assert!(status.success());
        assert!(!env.daemon_marker(pid).exists());
        assert!(!env.stop_marker(pid).exists());
    }

    #[test]
    fn forced_stop_kills_daemon_and_cleans_markers() {
        let server = FakeServer::start(lib101_candidates(), Some(lib101_groups()));
        let env = Env::new(&server.base);
        let mut daemon = env.spawn_daemon(&["--update-delay", "10"]);
        let pid = daemon.id();

        assert!(wait_until(Duration::from_secs(15), || env
            .daemon_marker(pid)
            .exists()));

        env.command().args(["stop", "--force"]).assert().success();

        let exited = wait_for_exit(&mut daemon, Duration::from_secs(10));
        assert!(exited.is_some());
        assert!(env.marker_files().is_empty(), "{:?}", env.marker_files());
    }

    #[test]
    fn forced_stop_of_dead_instance_cleans_markers() {
        let env = Env::new("http://127.0.0.1:9");
        let pid = dead_pid();
        write_markers(&env.markers, pid, true);

        env.command().args(["stop", "--force"]).assert().success();

        assert!(!env.daemon_marker(pid).exists());
        assert!(!env.stop_marker(pid).exists());
    }

    #[test]
    fn graceful_stop_of_stale_marker_succeeds() {
        let env = Env::new("http://127.0.0.1:9");
        let pid = dead_pid();
        write_markers(&env.markers, pid, false);

        env.command().arg("stop").assert().success();

        assert!(env.marker_files().is_empty());
    }

    #[test]
    fn graceful_stop_times_out_on_unresponsive_process() {
        let env = Env::new("http://127.0.0.1:9");
        // A live process that never looks at its stop marker.
        let mut sleeper = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        write_markers(&env.markers, sleeper.id(), false);

        env.command()
            .args(["stop", "--timeout", "1"])
            .assert()
            .code(1);

        assert!(env.daemon_marker(sleeper.id()).exists());
        let _ = sleeper.kill();
        let _ = sleeper.wait();
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

mod status {
    use super::*;

    #[test]
    fn json_lists_stale_instance() {
        let env = Env::new("http://127.0.0.1:9");
        let pid = dead_pid();
        write_markers(&env.markers, pid, true);

        let output = env
            .command()
            .args(["status", "--json"])
            .output()
            .expect("status");
        assert!(output.status.success());

        let doc: Value = serde_json::from_slice(&output.stdout).expect("json on stdout");
        let instances = doc["instances"].as_array().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0]["instance"], pid);
        assert_eq!(instances[0]["alive"], false);
        assert_eq!(instances[0]["stop_requested"], true);
    }

    #[test]
    fn text_marks_live_instance_alive() {
        let env = Env::new("http://127.0.0.1:9");
        let pid = std::process::id();
        write_markers(&env.markers, pid, false);

        env.command()
            .arg("status")
            .assert()
            .success()
            .stdout(
                predicate::str::contains(pid.to_string()).and(predicate::str::contains("alive")),
            );
    }
}
