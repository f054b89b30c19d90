//! Settings file parsing and environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::resolve::{resolve_config_path, ResolvedPath};
use crate::validate::ValidationError;

pub const ENV_SERVER_HOST: &str = "LABSTATS_SERVER_HOST";
pub const ENV_OAUTH_KEY: &str = "LABSTATS_OAUTH_KEY";
pub const ENV_OAUTH_SECRET: &str = "LABSTATS_OAUTH_SECRET";
pub const ENV_LABSTATS_URL: &str = "LABSTATS_URL";
pub const ENV_REQUEST_TIMEOUT: &str = "LABSTATS_REQUEST_TIMEOUT";
pub const ENV_MARKER_DIR: &str = "LABSTATS_MARKER_DIR";
pub const ENV_STOP_TIMEOUT: &str = "LABSTATS_STOP_TIMEOUT";
pub const ENV_SIGNATURE_METHOD: &str = "LABSTATS_OAUTH_SIGNATURE_METHOD";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 60;
const MARKER_DIR_NAME: &str = "labstats-updater";

/// Errors that can occur while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<ConfigError> for labstats_common::Error {
    fn from(err: ConfigError) -> Self {
        labstats_common::Error::Configuration(err.to_string())
    }
}

/// OAuth 1.0a signature method used against the spot API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureMethod {
    #[default]
    #[serde(rename = "HMAC-SHA1")]
    HmacSha1,
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

impl SignatureMethod {
    /// Name as sent in `oauth_signature_method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::HmacSha1 => "HMAC-SHA1",
            SignatureMethod::HmacSha256 => "HMAC-SHA256",
        }
    }
}

impl std::fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignatureMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HMAC-SHA1" => Ok(SignatureMethod::HmacSha1),
            "HMAC-SHA256" => Ok(SignatureMethod::HmacSha256),
            _ => Err("expected HMAC-SHA1 or HMAC-SHA256".to_string()),
        }
    }
}

/// Raw settings as read from file and environment.
///
/// Required keys are optional here; [`crate::validate_for_run`] decides
/// whether the run command can start. The stop command only reads
/// `marker_dir` and `stop_timeout_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Base URL of the spot API, e.g. `https://spotseeker.example.edu`.
    pub server_host: Option<String>,
    pub oauth_key: Option<String>,
    pub oauth_secret: Option<String>,
    pub oauth_signature_method: SignatureMethod,
    /// Endpoint of the labstats monitoring service.
    pub labstats_url: Option<String>,
    /// Per-request timeout for both collaborators.
    pub request_timeout_secs: u64,
    /// Directory holding `<pid>.pid` and `<pid>.stop` markers.
    pub marker_dir: Option<PathBuf>,
    /// How long a graceful stop waits for the instance to tear down.
    pub stop_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_host: None,
            oauth_key: None,
            oauth_secret: None,
            oauth_signature_method: SignatureMethod::default(),
            labstats_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            marker_dir: None,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Parse a settings document.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `LABSTATS_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_SERVER_HOST) {
            self.server_host = Some(v);
        }
        if let Some(v) = get(ENV_OAUTH_KEY) {
            self.oauth_key = Some(v);
        }
        if let Some(v) = get(ENV_OAUTH_SECRET) {
            self.oauth_secret = Some(v);
        }
        if let Some(v) = get(ENV_SIGNATURE_METHOD) {
            self.oauth_signature_method =
                v.parse().map_err(|reason| ConfigError::InvalidEnv {
                    var: ENV_SIGNATURE_METHOD,
                    value: v.clone(),
                    reason,
                })?;
        }
        if let Some(v) = get(ENV_LABSTATS_URL) {
            self.labstats_url = Some(v);
        }
        if let Some(v) = get(ENV_MARKER_DIR) {
            self.marker_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_REQUEST_TIMEOUT) {
            self.request_timeout_secs = parse_secs(ENV_REQUEST_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_STOP_TIMEOUT) {
            self.stop_timeout_secs = parse_secs(ENV_STOP_TIMEOUT, &v)?;
        }
        Ok(())
    }

    /// Marker directory, falling back to the shared temp location.
    pub fn marker_dir(&self) -> PathBuf {
        self.marker_dir.clone().unwrap_or_else(default_marker_dir)
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Default marker directory under the system temp dir.
pub fn default_marker_dir() -> PathBuf {
    std::env::temp_dir().join(MARKER_DIR_NAME)
}

/// Load settings: resolve the file, parse it if any, then apply env overrides.
pub fn load_settings(cli_path: Option<&Path>) -> Result<(Settings, ResolvedPath), ConfigError> {
    let resolved = resolve_config_path(cli_path);

    let mut settings = match &resolved.path {
        Some(path) => load_settings_file(path)?,
        None => Settings::default(),
    };
    settings.apply_env()?;

    Ok((settings, resolved))
}

fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    Settings::from_toml_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
