//! Filesystem marker store.
//!
//! Two tokens per daemon instance live in one directory:
//!
//! - `<pid>.pid`: the daemon marker, present while the instance runs.
//! - `<pid>.stop`: the stop marker, present while a stop is requested.
//!
//! Both contain the instance's pid as their only content. Creation is
//! idempotent and removal of an absent marker is not an error, so either
//! side of the stop protocol can race the other safely.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use labstats_common::InstanceId;
use thiserror::Error;

const DAEMON_SUFFIX: &str = "pid";
const STOP_SUFFIX: &str = "stop";

/// A marker or the marker directory could not be touched.
#[derive(Error, Debug)]
#[error("cannot {action} {}: {source}", path.display())]
pub struct MarkerError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl MarkerError {
    fn new(action: &'static str, path: &Path, source: io::Error) -> Self {
        MarkerError {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<MarkerError> for labstats_common::Error {
    fn from(err: MarkerError) -> Self {
        labstats_common::Error::resource(err.action, err.path, err.source)
    }
}

/// Create/check/delete token store keyed by instance identity.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MarkerStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn daemon_path(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, DAEMON_SUFFIX))
    }

    pub fn stop_path(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, STOP_SUFFIX))
    }

    /// Create the marker directory if absent, owner-only on unix.
    pub fn ensure_dir(&self) -> Result<(), MarkerError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&self.dir)
            .map_err(|e| MarkerError::new("create directory", &self.dir, e))
    }

    /// Write the daemon marker for `id`.
    pub fn create_daemon_marker(&self, id: InstanceId) -> Result<PathBuf, MarkerError> {
        self.ensure_dir()?;
        let path = self.daemon_path(id);
        write_atomic(&path, id)?;
        Ok(path)
    }

    /// Write the stop marker for `id`. Writing it twice is the same as once.
    pub fn request_stop(&self, id: InstanceId) -> Result<(), MarkerError> {
        self.ensure_dir()?;
        write_atomic(&self.stop_path(id), id)
    }

    pub fn has_daemon_marker(&self, id: InstanceId) -> bool {
        self.daemon_path(id).exists()
    }

    pub fn has_stop_marker(&self, id: InstanceId) -> bool {
        self.stop_path(id).exists()
    }

    /// Consume the stop marker: `Ok(true)` iff it existed and was removed by
    /// this call.
    ///
    /// The removal itself is the existence check, so a request written
    /// between a separate check and delete cannot be lost.
    pub fn take_stop(&self, id: InstanceId) -> Result<bool, MarkerError> {
        remove_if_present(&self.stop_path(id))
    }

    /// Remove the daemon marker. `Ok(false)` if it was already gone.
    pub fn remove_daemon_marker(&self, id: InstanceId) -> Result<bool, MarkerError> {
        remove_if_present(&self.daemon_path(id))
    }

    /// Remove the stop marker. `Ok(false)` if it was already gone.
    pub fn remove_stop_marker(&self, id: InstanceId) -> Result<bool, MarkerError> {
        remove_if_present(&self.stop_path(id))
    }

    /// Instances with a daemon marker, ascending. A missing directory means
    /// no instances.
    pub fn list_instances(&self) -> Result<Vec<InstanceId>, MarkerError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MarkerError::new("read directory", &self.dir, e)),
        };

        let mut instances: Vec<InstanceId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_daemon_marker_name(&entry.file_name().to_string_lossy()))
            .collect();
        instances.sort();
        instances.dedup();
        Ok(instances)
    }
}

/// `"1234.pid"` -> `Some(InstanceId(1234))`; anything else is not ours.
pub fn parse_daemon_marker_name(name: &str) -> Option<InstanceId> {
    let stem = name.strip_suffix(DAEMON_SUFFIX)?.strip_suffix('.')?;
    InstanceId::parse(stem).filter(|_| stem.trim() == stem)
}

fn write_atomic(path: &Path, id: InstanceId) -> Result<(), MarkerError> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("marker");
    let tmp_path = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    fs::write(&tmp_path, id.to_string()).map_err(|e| MarkerError::new("write", &tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        MarkerError::new("write", path, e)
    })
}

fn remove_if_present(path: &Path) -> Result<bool, MarkerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MarkerError::new("remove", path, e)),
    }
}
