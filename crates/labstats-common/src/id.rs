//! Instance and spot identity types.
//!
//! An `InstanceId` is the process identity of a running daemon; marker files
//! are named after it. A `SpotId` is the opaque identifier the spot API hands
//! out and expects back on upload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identity of one daemon instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Identity of the calling process.
    pub fn current() -> Self {
        InstanceId(std::process::id())
    }

    /// Parse the decimal form written into marker files and marker names.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse::<u32>().ok().filter(|pid| *pid > 0).map(InstanceId)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(pid: u32) -> Self {
        InstanceId(pid)
    }
}

/// Opaque spot identifier.
///
/// The spot API returns numeric ids today, but nothing here depends on that:
/// the value is carried through verbatim and echoed back on upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpotId(pub serde_json::Value);

impl SpotId {
    /// Form used in URL paths: strings unquoted, everything else as JSON.
    pub fn as_path_segment(&self) -> String {
        match &self.0 {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for SpotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path_segment())
    }
}

impl From<&str> for SpotId {
    fn from(id: &str) -> Self {
        SpotId(serde_json::Value::String(id.to_string()))
    }
}

impl From<u64> for SpotId {
    fn from(id: u64) -> Self {
        SpotId(serde_json::Value::from(id))
    }
}
