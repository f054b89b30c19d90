//! Validation of the settings the run command needs.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::settings::{
    Settings, SignatureMethod, ENV_LABSTATS_URL, ENV_OAUTH_KEY, ENV_OAUTH_SECRET,
    ENV_REQUEST_TIMEOUT, ENV_SERVER_HOST,
};

/// A setting the run command cannot start without is missing or unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required setting missing: {key} (or {env})")]
    MissingRequired {
        key: &'static str,
        env: &'static str,
    },

    #[error("Setting {key} must be an http(s) URL, got {value:?}")]
    InvalidUrl { key: &'static str, value: String },

    #[error("Setting {key} (or {env}) must be greater than zero")]
    ZeroTimeout {
        key: &'static str,
        env: &'static str,
    },
}

/// Settings checked for the run command.
#[derive(Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Spot API base URL without a trailing slash.
    pub server_host: String,
    pub oauth_key: String,
    pub oauth_secret: String,
    pub signature_method: SignatureMethod,
    pub labstats_url: String,
    pub request_timeout: Duration,
    pub marker_dir: PathBuf,
}

impl std::fmt::Debug for DaemonSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonSettings")
            .field("server_host", &self.server_host)
            .field("oauth_key", &self.oauth_key)
            .field("oauth_secret", &"[redacted]")
            .field("signature_method", &self.signature_method)
            .field("labstats_url", &self.labstats_url)
            .field("request_timeout", &self.request_timeout)
            .field("marker_dir", &self.marker_dir)
            .finish()
    }
}

/// Check required keys. The spot API base URL is checked first so its
/// absence is always the reported error.
pub fn validate_for_run(settings: &Settings) -> Result<DaemonSettings, ValidationError> {
    let server_host = required(&settings.server_host, "server_host", ENV_SERVER_HOST)?;
    let server_host = http_url("server_host", server_host)?;
    let oauth_key = required(&settings.oauth_key, "oauth_key", ENV_OAUTH_KEY)?;
    let oauth_secret = required(&settings.oauth_secret, "oauth_secret", ENV_OAUTH_SECRET)?;
    let labstats_url = required(&settings.labstats_url, "labstats_url", ENV_LABSTATS_URL)?;
    let labstats_url = http_url("labstats_url", labstats_url)?;

    if settings.request_timeout_secs == 0 {
        return Err(ValidationError::ZeroTimeout {
            key: "request_timeout_secs",
            env: ENV_REQUEST_TIMEOUT,
        });
    }

    Ok(DaemonSettings {
        server_host: server_host.trim_end_matches('/').to_string(),
        oauth_key: oauth_key.to_string(),
        oauth_secret: oauth_secret.to_string(),
        signature_method: settings.oauth_signature_method,
        labstats_url: labstats_url.to_string(),
        request_timeout: Duration::from_secs(settings.request_timeout_secs),
        marker_dir: settings.marker_dir(),
    })
}

fn required<'a>(
    value: &'a Option<String>,
    key: &'static str,
    env: &'static str,
) -> Result<&'a str, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::MissingRequired { key, env }),
    }
}

fn http_url<'a>(key: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
    let lower = value.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(value),
        _ => Err(ValidationError::InvalidUrl {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Settings {
        Settings {
            server_host: Some("https://spots.example.edu/".into()),
            oauth_key: Some("key".into()),
            oauth_secret: Some("secret".into()),
            labstats_url: Some("http://labstats.example.edu/api/groups".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn complete_settings_validate() {
        let daemon = validate_for_run(&complete()).unwrap();
        assert_eq!(daemon.server_host, "https://spots.example.edu");
        assert_eq!(daemon.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_server_host_reported_first() {
        let settings = Settings {
            server_host: None,
            oauth_key: None,
            ..complete()
        };
        assert_eq!(
            validate_for_run(&settings).unwrap_err(),
            ValidationError::MissingRequired {
                key: "server_host",
                env: ENV_SERVER_HOST
            }
        );
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let settings = Settings {
            oauth_secret: Some("   ".into()),
            ..complete()
        };
        assert!(matches!(
            validate_for_run(&settings),
            Err(ValidationError::MissingRequired {
                key: "oauth_secret",
                ..
            })
        ));
    }

    #[test]
    fn non_http_url_rejected() {
        let settings = Settings {
            labstats_url: Some("ftp://labstats".into()),
            ..complete()
        };
        assert!(matches!(
            validate_for_run(&settings),
            Err(ValidationError::InvalidUrl {
                key: "labstats_url",
                ..
            })
        ));
    }

    #[test]
    fn zero_timeout_rejected() {
        let settings = Settings {
            request_timeout_secs: 0,
            ..complete()
        };
        assert!(matches!(
            validate_for_run(&settings),
            Err(ValidationError::ZeroTimeout { .. })
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let daemon = validate_for_run(&complete()).unwrap();
        let shown = format!("{daemon:?}");
        assert!(!shown.contains("\"secret\""));
        assert!(shown.contains("[redacted]"));
    }
}
