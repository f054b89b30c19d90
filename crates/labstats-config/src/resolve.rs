//! Configuration file resolution.
//!
//! Resolution order: CLI argument → `LABSTATS_CONFIG` → XDG config dir →
//! `/etc/labstats` → no file (environment only).

use std::path::{Path, PathBuf};

use crate::CONFIG_FILENAME;

/// Where the settings file came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via `--config`.
    CliArgument,

    /// Set via `LABSTATS_CONFIG`.
    Environment,

    /// Found in the XDG config directory.
    XdgConfig,

    /// Found in /etc/labstats/.
    SystemConfig,

    /// No file; settings come from the environment alone.
    #[default]
    EnvironmentOnly,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::EnvironmentOnly => write!(f, "environment only"),
        }
    }
}

/// A resolved settings file location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Environment variable naming an explicit settings file.
pub const ENV_CONFIG_PATH: &str = "LABSTATS_CONFIG";

/// Application name for XDG and system directories.
const APP_NAME: &str = "labstats";

/// Resolve the settings file path.
///
/// Explicit locations (CLI, env) are returned even when the file is missing
/// so the loader can report them; discovered locations must exist.
pub fn resolve_config_path(cli_path: Option<&Path>) -> ResolvedPath {
    if let Some(path) = cli_path {
        return ResolvedPath {
            path: Some(path.to_path_buf()),
            source: ConfigSource::CliArgument,
        };
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        if !env_path.is_empty() {
            return ResolvedPath {
                path: Some(PathBuf::from(env_path)),
                source: ConfigSource::Environment,
            };
        }
    }

    if let Some(dir) = xdg_config_dir() {
        let path = dir.join(CONFIG_FILENAME);
        if path.is_file() {
            return ResolvedPath {
                path: Some(path),
                source: ConfigSource::XdgConfig,
            };
        }
    }

    let system_path = system_config_dir().join(CONFIG_FILENAME);
    if system_path.is_file() {
        return ResolvedPath {
            path: Some(system_path),
            source: ConfigSource::SystemConfig,
        };
    }

    ResolvedPath::default()
}

/// XDG config directory for the daemon.
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// System config directory.
pub fn system_config_dir() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_source_display() {
        assert_eq!(format!("{}", ConfigSource::CliArgument), "CLI argument");
        assert_eq!(
            format!("{}", ConfigSource::Environment),
            "environment variable"
        );
        assert_eq!(format!("{}", ConfigSource::XdgConfig), "XDG config");
        assert_eq!(format!("{}", ConfigSource::SystemConfig), "system config");
        assert_eq!(
            format!("{}", ConfigSource::EnvironmentOnly),
            "environment only"
        );
    }

    #[test]
    fn test_cli_path_wins_even_if_missing() {
        let resolved = resolve_config_path(Some(Path::new("/nonexistent/daemon.toml")));
        assert_eq!(resolved.source, ConfigSource::CliArgument);
        assert_eq!(
            resolved.path,
            Some(PathBuf::from("/nonexistent/daemon.toml"))
        );
    }

    #[test]
    fn test_xdg_config_dir() {
        if let Some(path) = xdg_config_dir() {
            assert!(path.ends_with(APP_NAME));
        }
    }

    #[test]
    fn test_system_config_dir() {
        assert_eq!(system_config_dir(), PathBuf::from("/etc/labstats"));
    }
}
